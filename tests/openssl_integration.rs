//! OpenSSL session integration tests
//!
//! Each test runs an OpenSSL acceptor in a thread and drives a client
//! session over a non-blocking socket:
//! - Rejection of untrusted and revoked certificates
//! - Warn-only verification policy
//! - Encrypted echo and clean shutdown
//! - Session resumption

use fdtls::tls::poll::drive;
use fdtls::tls::{
    Backend, PolicyMap, Role, Status, TlsError, TlsOption, TlsSession, TrustContext,
};
use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslMethod, SslVersion};
use openssl::x509::X509;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

/// Helper to start an echo server presenting `cert`
///
/// The server answers `connections` connections, echoing the first
/// message of each and then closing cleanly.
fn spawn_server(cert: &str, max_version: Option<SslVersion>, connections: usize) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let pem = fs::read(fixture(cert)).unwrap();

    thread::spawn(move || {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
        builder.set_certificate(&X509::from_pem(&pem).unwrap()).unwrap();
        builder.set_private_key(&PKey::private_key_from_pem(&pem).unwrap()).unwrap();
        builder.set_max_proto_version(max_version).unwrap();
        builder.set_session_id_context(b"fdtls-tests").unwrap();
        let acceptor = builder.build();

        for stream in listener.incoming().take(connections) {
            let Ok(stream) = stream else { continue };
            // The client may reject the certificate mid-handshake
            let Ok(mut tls) = acceptor.accept(stream) else { continue };
            let mut buf = [0u8; 64];
            if let Ok(n) = tls.read(&mut buf) {
                if n > 0 {
                    let _ = tls.write_all(&buf[..n]);
                }
            }
            let _ = tls.shutdown();
        }
    });

    port
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_nonblocking(true).unwrap();
    stream
}

/// Trust context anchored at the test CA
fn trust(policy: PolicyMap) -> Arc<TrustContext> {
    TrustContext::new(Arc::new(policy.set(TlsOption::TrustAnchorFile, fixture("ca.pem"))))
}

fn handshake<S: TlsSession + ?Sized>(session: &mut S, stream: &TcpStream) -> Status<()> {
    drive(session, stream.as_fd(), TIMEOUT, |s| s.do_handshake()).unwrap()
}

/// Send `msg` and return what comes back
fn echo<S: TlsSession + ?Sized>(session: &mut S, stream: &TcpStream, msg: &[u8]) -> Vec<u8> {
    let written = drive(session, stream.as_fd(), TIMEOUT, |s| s.encrypted_write(msg)).unwrap();
    assert_eq!(written, Status::Done(msg.len()));

    let mut buf = [0u8; 64];
    match drive(session, stream.as_fd(), TIMEOUT, |s| s.encrypted_read(&mut buf)).unwrap() {
        Status::Done(n) => buf[..n].to_vec(),
        other => panic!("read failed: {:?} ({:?})", other, session.last_error()),
    }
}

#[test]
fn test_self_signed_rejected_by_default() {
    let port = spawn_server("self.pem", None, 1);
    let stream = connect(port);

    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "localhost", trust(PolicyMap::new()))
        .unwrap();

    assert_eq!(handshake(session.as_mut(), &stream), Status::Error);
    assert!(session.is_fatal());
    let message = session.last_error().unwrap();
    assert!(message.starts_with("SSL_connect: "), "{}", message);
    assert!(message.len() > "SSL_connect: ".len());
    assert!(!session.handshake_done());
}

#[test]
fn test_self_signed_accepted_in_warn_mode() {
    let port = spawn_server("self.pem", None, 1);
    let stream = connect(port);

    let policy = PolicyMap::new().set_for_host("localhost", TlsOption::VerifyCertificate, "no");
    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "localhost", trust(policy))
        .unwrap();

    assert_eq!(handshake(session.as_mut(), &stream), Status::Done(()));
    assert_eq!(echo(session.as_mut(), &stream, b"ping"), b"ping");
}

#[test]
fn test_trusted_chain_echo_and_close() {
    let port = spawn_server("server.pem", None, 1);
    let stream = connect(port);

    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "localhost", trust(PolicyMap::new()))
        .unwrap();

    assert_eq!(handshake(session.as_mut(), &stream), Status::Done(()));
    assert!(session.handshake_done());
    // Completed handshakes are not repeated
    assert_eq!(session.do_handshake(), Status::Done(()));

    // An empty read is not end of stream
    assert_eq!(session.encrypted_read(&mut []), Status::Done(0));
    assert_eq!(echo(session.as_mut(), &stream, b"hello over tls"), b"hello over tls");

    let mut buf = [0u8; 16];
    let closed = drive(session.as_mut(), stream.as_fd(), TIMEOUT, |s| s.encrypted_read(&mut buf)).unwrap();
    assert_eq!(closed, Status::Done(0));
    assert!(session.last_error().is_none());
}

#[test]
fn test_hostname_mismatch_rejected() {
    let port = spawn_server("server.pem", None, 1);
    let stream = connect(port);

    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "wrong.example.net", trust(PolicyMap::new()))
        .unwrap();

    assert_eq!(handshake(session.as_mut(), &stream), Status::Error);
    assert!(session.is_fatal());
}

#[test]
fn test_ip_literal_hostname() {
    let port = spawn_server("server.pem", None, 1);
    let stream = connect(port);

    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "127.0.0.1", trust(PolicyMap::new()))
        .unwrap();

    assert_eq!(handshake(session.as_mut(), &stream), Status::Done(()));
}

#[test]
fn test_revoked_certificate_rejected() {
    let policy = PolicyMap::new().set(TlsOption::RevocationListFile, fixture("crl-revoked.pem"));
    let trust = trust(policy);
    assert_eq!(trust.revocation().map(|store| store.len()), Some(1));

    let port = spawn_server("server.pem", None, 1);
    let stream = connect(port);
    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "localhost", trust.clone())
        .unwrap();
    assert_eq!(handshake(session.as_mut(), &stream), Status::Error);
    let message = session.last_error().unwrap();
    assert_eq!(message, "SSL_connect: certificate revoked");

    // Same CA, serial not listed
    let port = spawn_server("other.pem", None, 1);
    let stream = connect(port);
    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "localhost", trust)
        .unwrap();
    assert_eq!(handshake(session.as_mut(), &stream), Status::Done(()));
}

#[test]
fn test_expired_crl_rejects_its_issuer() {
    let policy = PolicyMap::new().set(TlsOption::RevocationListFile, fixture("crl-expired.pem"));

    let port = spawn_server("other.pem", None, 1);
    let stream = connect(port);
    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "localhost", trust(policy))
        .unwrap();

    assert_eq!(handshake(session.as_mut(), &stream), Status::Error);
    assert_eq!(session.last_error(), Some("SSL_connect: CRL has expired"));
}

#[test]
fn test_revocation_follows_warn_mode() {
    let policy = PolicyMap::new()
        .set(TlsOption::RevocationListFile, fixture("crl-revoked.pem"))
        .set(TlsOption::VerifyCertificate, "no");

    let port = spawn_server("server.pem", None, 1);
    let stream = connect(port);
    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "localhost", trust(policy))
        .unwrap();

    assert_eq!(handshake(session.as_mut(), &stream), Status::Done(()));
}

#[test]
fn test_session_resumption() {
    let port = spawn_server("server.pem", Some(SslVersion::TLS1_2), 2);
    let trust = trust(PolicyMap::new());

    let first_stream = connect(port);
    let mut first = Backend::OpenSsl
        .open(first_stream.as_fd(), Role::Client, "localhost", trust.clone())
        .unwrap();
    assert_eq!(handshake(first.as_mut(), &first_stream), Status::Done(()));
    assert!(!first.session_resumed());
    assert_eq!(echo(first.as_mut(), &first_stream, b"one"), b"one");

    let second_stream = connect(port);
    let mut second = Backend::OpenSsl
        .open(second_stream.as_fd(), Role::Client, "localhost", trust)
        .unwrap();
    second.copy_session_state(first.as_ref()).unwrap();

    // The token is an independent copy
    drop(first);
    drop(first_stream);

    assert_eq!(handshake(second.as_mut(), &second_stream), Status::Done(()));
    assert!(second.session_resumed());
    assert_eq!(echo(second.as_mut(), &second_stream, b"two"), b"two");
}

#[test]
fn test_import_after_handshake_started_rejected() {
    let port = spawn_server("server.pem", Some(SslVersion::TLS1_2), 2);
    let trust = trust(PolicyMap::new());

    let first_stream = connect(port);
    let mut first = Backend::OpenSsl
        .open(first_stream.as_fd(), Role::Client, "localhost", trust.clone())
        .unwrap();
    assert_eq!(handshake(first.as_mut(), &first_stream), Status::Done(()));
    // The server answers one connection at a time; let it finish this one
    assert_eq!(echo(first.as_mut(), &first_stream, b"one"), b"one");

    let second_stream = connect(port);
    let mut second = Backend::OpenSsl
        .open(second_stream.as_fd(), Role::Client, "localhost", trust)
        .unwrap();
    assert_eq!(handshake(second.as_mut(), &second_stream), Status::Done(()));

    assert!(matches!(
        second.copy_session_state(first.as_ref()),
        Err(TlsError::SessionResumptionFailed(_))
    ));
}

#[test]
fn test_policy_from_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("tls.conf");
    fs::write(
        &settings,
        format!(
            "# test settings\ntrust-anchor-file {}\nverify-certificate/localhost yes\n",
            fixture("ca.pem")
        ),
    )
    .unwrap();

    let policy = PolicyMap::parse(&fs::read_to_string(&settings).unwrap()).unwrap();
    let trust = TrustContext::new(Arc::new(policy));

    let port = spawn_server("server.pem", None, 1);
    let stream = connect(port);
    let mut session = Backend::OpenSsl
        .open(stream.as_fd(), Role::Client, "localhost", trust)
        .unwrap();
    assert_eq!(handshake(session.as_mut(), &stream), Status::Done(()));
}

#[test]
fn test_descriptor_survives_session() {
    let port = spawn_server("server.pem", None, 1);
    let stream = connect(port);

    {
        let mut session = Backend::OpenSsl
            .open(stream.as_fd(), Role::Client, "localhost", trust(PolicyMap::new()))
            .unwrap();
        assert_eq!(handshake(session.as_mut(), &stream), Status::Done(()));
    }

    // Dropping the session must not close the socket
    assert!(stream.peer_addr().is_ok());
}
