//! fdtls - non-blocking TLS sessions over borrowed file descriptors
//!
//! This crate lets a single-threaded network client run a TLS handshake,
//! encrypted reads and writes, and certificate-chain verification with CRL
//! checking over a descriptor it owns, with the same semantics whichever
//! cryptographic backend (OpenSSL or rustls) is selected.

pub mod tls;
