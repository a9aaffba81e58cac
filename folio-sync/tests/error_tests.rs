use folio_sync::{RetryClass, SyncError};
use std::io;

// ── Retry classes ─────────────────────────────────────────────────

#[test]
fn connection_and_transfer_failures_back_off() {
    assert_eq!(
        SyncError::ConnectionFailed("refused".into()).retry_class(),
        RetryClass::Backoff
    );
    assert_eq!(
        SyncError::TransferFailed("reset".into()).retry_class(),
        RetryClass::Backoff
    );
    assert!(SyncError::TransferFailed("reset".into()).is_transient());
}

#[test]
fn network_loss_waits_for_reconnect() {
    assert_eq!(
        SyncError::NetworkUnavailable.retry_class(),
        RetryClass::AfterReconnect
    );
    assert!(!SyncError::NetworkUnavailable.is_transient());
}

#[test]
fn missing_device_waits_for_rediscovery() {
    assert_eq!(
        SyncError::DeviceNotFound("pixel".into()).retry_class(),
        RetryClass::AfterRediscovery
    );
}

#[test]
fn user_facing_errors_are_never_retried() {
    let errors = [
        SyncError::AuthenticationFailed("not trusted".into()),
        SyncError::incompatible("1.0.0", "2.0.0"),
        SyncError::ConflictResolutionFailed("manual".into()),
        SyncError::InsufficientStorage {
            required: 10,
            available: 1,
        },
        SyncError::Cancelled,
        SyncError::Storage("disk".into()),
        SyncError::Unknown("?".into()),
    ];
    for e in errors {
        assert_eq!(e.retry_class(), RetryClass::Never, "{e}");
        assert!(!e.is_transient());
    }
}

#[test]
fn only_cancelled_is_cancelled() {
    assert!(SyncError::Cancelled.is_cancelled());
    assert!(!SyncError::TransferFailed("x".into()).is_cancelled());
}

// ── Conversions ───────────────────────────────────────────────────

#[test]
fn io_refused_is_connection_failure() {
    let e: SyncError = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
    assert!(matches!(e, SyncError::ConnectionFailed(_)));
}

#[test]
fn io_timeout_is_connection_failure() {
    let e: SyncError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
    assert!(matches!(e, SyncError::ConnectionFailed(_)));
}

#[test]
fn io_network_down_is_network_unavailable() {
    let e: SyncError = io::Error::new(io::ErrorKind::NetworkUnreachable, "no route").into();
    assert_eq!(e, SyncError::NetworkUnavailable);
}

#[test]
fn io_reset_mid_stream_is_transfer_failure() {
    let e: SyncError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
    assert!(matches!(e, SyncError::TransferFailed(_)));
    let e: SyncError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
    assert!(matches!(e, SyncError::TransferFailed(_)));
}

#[test]
fn malformed_json_is_transfer_failure() {
    let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let e: SyncError = parse.into();
    match e {
        SyncError::TransferFailed(msg) => assert!(msg.starts_with("malformed message")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn duplicate_manifest_item_is_transfer_failure() {
    let id = folio_types::ItemId::book("b1");
    let e: SyncError = folio_types::Error::DuplicateItem(id).into();
    match e {
        SyncError::TransferFailed(msg) => assert!(msg.contains("book:b1")),
        other => panic!("unexpected {other:?}"),
    }
}

// ── Display ───────────────────────────────────────────────────────

#[test]
fn display_messages() {
    assert_eq!(SyncError::Cancelled.to_string(), "sync cancelled");
    assert_eq!(
        SyncError::incompatible("1.2.0", "2.0.0").to_string(),
        "incompatible app versions: local 1.2.0, remote 2.0.0"
    );
    assert_eq!(
        SyncError::InsufficientStorage {
            required: 2048,
            available: 1024
        }
        .to_string(),
        "insufficient storage: 2048 bytes required, 1024 available"
    );
}
