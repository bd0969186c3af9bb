//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (SIP transactions, transports, digest auth)

pub mod protocols;
