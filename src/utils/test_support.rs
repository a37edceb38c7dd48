//! Helpers shared by the mock-backend integration tests.

use std::net::{Ipv4Addr, TcpListener};

/// Reports whether the sandbox refuses loopback sockets, in which case tests that
/// stand up a mock Gemini server cannot run.
pub fn should_skip_httpmock() -> bool {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping mock backend test: loopback bind denied ({err})");
            true
        }
        // Anything else is a real failure; let the mock server surface it.
        Err(_) => false,
    }
}
