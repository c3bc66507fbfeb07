/// Helpers shared by unit tests, integration tests and anyone driving the stack in a test bed.
pub mod test;
