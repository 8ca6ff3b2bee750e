//! Signer subprocess limits.

use butler::signer::{FakeSignerConfig, Signer, SignerError, SignerKind};
use std::time::{Duration, Instant};

fn script(body: String) -> Signer {
    Signer::new(SignerKind::Fake(FakeSignerConfig {
        bin: "/bin/sh".into(),
        args: vec!["-c".into(), body],
        passphrase: String::new(),
    }))
}

#[tokio::test]
async fn test_slow_signer_is_killed_at_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("finished");
    let signer = script(format!("sleep 2; touch {}", marker.display()))
        .with_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let err = signer.sign(b"csr", "bmc-1").await.unwrap_err();
    assert!(matches!(err, SignerError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(2));

    // A surviving child would create the marker once its sleep ends.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_timeout_kills_processes_forked_by_signer() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("finished");
    // The subshell is a separate process from the one the signer spawned.
    let signer = script(format!("(sleep 1; touch {}); true", marker.display()))
        .with_timeout(Duration::from_millis(200));

    let err = signer.sign(b"csr", "bmc-1").await.unwrap_err();
    assert!(matches!(err, SignerError::Timeout(_)));

    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_signer_output_is_returned_verbatim() {
    let signer = script("cat > /dev/null; printf 'CERT\\nCHAIN\\n'".to_string());
    let out = signer.sign(b"csr", "bmc-1").await.unwrap();
    assert_eq!(out, b"CERT\nCHAIN\n");
}

#[tokio::test]
async fn test_signer_sees_debug_flag() {
    let signer = script("printf '%s' \"${DEBUG_SIGNER:-0}\"".to_string()).with_debug(true);
    let out = signer.sign(b"", "bmc-1").await.unwrap();
    assert_eq!(out, b"1");
}
