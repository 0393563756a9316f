//! Integration tests for the firmware agent

mod test_agent;
mod test_checker;
