//! Update checker tests

use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};

use fwagent::errors::{InstallError, UpdateError};
use fwagent::update::checker::{self, CheckOutcome, UpdateChecker};
use fwagent::utils::sha256_hash;
use fwagent::version::VersionOrdering;

use crate::fakes::{firmware_url, installer, version_url, FakeHttp, FakeResponse, MemSlot, API_URL};

const IMAGE: &[u8] = b"firmware image 1.0.2";

fn checker(http: &FakeHttp) -> UpdateChecker {
    UpdateChecker::new(
        Arc::new(http.clone()),
        checker::Options {
            api_url: API_URL.to_string(),
            current_version: "1.0.1".to_string(),
            ordering: VersionOrdering::default(),
        },
    )
}

#[tokio::test]
async fn test_newer_version_is_installed_from_api_firmware_path() {
    let http = FakeHttp::new()
        .route(&version_url(), FakeResponse::ok(br#"{"version":"1.0.2","url":"1.0.2"}"#))
        .route(&firmware_url("1.0.2"), FakeResponse::ok(IMAGE));
    let slot = MemSlot::new(1024);

    let outcome = checker(&http)
        .check_for_update(&mut installer(&slot))
        .await;

    let CheckOutcome::Installed(installed) = assert_ok!(outcome) else {
        panic!("expected an install");
    };
    assert_eq!(installed.size, IMAGE.len() as u64);
    assert_eq!(installed.sha256, sha256_hash(IMAGE));
    assert_eq!(slot.committed().as_deref(), Some(IMAGE));
    assert_eq!(http.requests(), vec![version_url(), firmware_url("1.0.2")]);
}

#[tokio::test]
async fn test_equal_version_is_up_to_date() {
    let http = FakeHttp::new().route(
        &version_url(),
        FakeResponse::ok(br#"{"version":"1.0.1","url":"1.0.1"}"#),
    );
    let slot = MemSlot::new(1024);

    let outcome = checker(&http)
        .check_for_update(&mut installer(&slot))
        .await;

    assert_eq!(
        outcome,
        Ok(CheckOutcome::UpToDate {
            latest: "1.0.1".to_string()
        })
    );
    assert_eq!(slot.begins(), 0);
    assert_eq!(http.requests(), vec![version_url()]);
}

#[tokio::test]
async fn test_older_version_is_not_installed() {
    let http = FakeHttp::new().route(
        &version_url(),
        FakeResponse::ok(br#"{"version":"1.0.0","url":"1.0.0"}"#),
    );
    let slot = MemSlot::new(1024);

    let outcome = checker(&http)
        .check_for_update(&mut installer(&slot))
        .await;

    assert!(matches!(outcome, Ok(CheckOutcome::UpToDate { .. })));
    assert_eq!(slot.begins(), 0);
}

#[tokio::test]
async fn test_malformed_descriptor_is_parse_error() {
    let http = FakeHttp::new().route(&version_url(), FakeResponse::ok(b"{\"version\": "));
    let slot = MemSlot::new(1024);

    let err = assert_err!(checker(&http).check_for_update(&mut installer(&slot)).await);

    assert!(matches!(err, UpdateError::ParseError(_)));
    assert_eq!(slot.begins(), 0);
    assert_eq!(http.requests().len(), 1);
}

#[tokio::test]
async fn test_version_endpoint_failure() {
    let http = FakeHttp::new().route(&version_url(), FakeResponse::status(500));
    let slot = MemSlot::new(1024);

    let result = checker(&http).check_for_update(&mut installer(&slot)).await;

    assert_eq!(result, Err(UpdateError::HttpFailure(500)));
}

#[tokio::test]
async fn test_firmware_not_found_leaves_slot_untouched() {
    let http = FakeHttp::new().route(
        &version_url(),
        FakeResponse::ok(br#"{"version":"1.0.2","url":"1.0.2"}"#),
    );
    let slot = MemSlot::new(1024);

    let result = checker(&http).check_for_update(&mut installer(&slot)).await;

    assert_eq!(result, Err(UpdateError::HttpFailure(404)));
    assert_eq!(slot.begins(), 0);
    assert!(slot.committed().is_none());
}

#[tokio::test]
async fn test_absolute_descriptor_url_is_used_as_is() {
    let http = FakeHttp::new()
        .route(
            &version_url(),
            FakeResponse::ok(br#"{"version":"1.0.2","url":"https://cdn.example.com/fw.bin"}"#),
        )
        .route("https://cdn.example.com/fw.bin", FakeResponse::ok(IMAGE));
    let slot = MemSlot::new(1024);

    let outcome = checker(&http).check_for_update(&mut installer(&slot)).await;

    assert!(matches!(outcome, Ok(CheckOutcome::Installed(_))));
    assert_eq!(http.requests()[1], "https://cdn.example.com/fw.bin");
}

#[tokio::test]
async fn test_descriptor_digest_mismatch_is_not_committed() {
    let descriptor = format!(
        r#"{{"version":"1.0.2","url":"1.0.2","sha256":"{}"}}"#,
        sha256_hash(b"some other image")
    );
    let http = FakeHttp::new()
        .route(&version_url(), FakeResponse::ok(descriptor.as_bytes()))
        .route(&firmware_url("1.0.2"), FakeResponse::ok(IMAGE));
    let slot = MemSlot::new(1024);

    let result = checker(&http).check_for_update(&mut installer(&slot)).await;

    assert!(matches!(
        result,
        Err(UpdateError::Install(InstallError::VerificationFailed(_)))
    ));
    assert!(slot.committed().is_none());
    assert_eq!(slot.aborts(), 1);
}

#[tokio::test]
async fn test_descriptor_digest_match_is_committed() {
    let descriptor = format!(
        r#"{{"version":"1.0.2","url":"1.0.2","sha256":"{}"}}"#,
        sha256_hash(IMAGE).to_uppercase()
    );
    let http = FakeHttp::new()
        .route(&version_url(), FakeResponse::ok(descriptor.as_bytes()))
        .route(&firmware_url("1.0.2"), FakeResponse::ok(IMAGE));
    let slot = MemSlot::new(1024);

    let result = checker(&http).check_for_update(&mut installer(&slot)).await;

    assert!(matches!(result, Ok(CheckOutcome::Installed(_))));
    assert_eq!(slot.committed().as_deref(), Some(IMAGE));
}

#[tokio::test]
async fn test_missing_content_length_is_unknown_size() {
    let http = FakeHttp::new().route(
        "http://host/fw.bin",
        FakeResponse {
            content_length: None,
            ..FakeResponse::ok(IMAGE)
        },
    );
    let slot = MemSlot::new(1024);

    let result = checker(&http)
        .install_from("http://host/fw.bin", None, &mut installer(&slot))
        .await;

    assert_eq!(result, Err(UpdateError::Install(InstallError::UnknownSize)));
    assert_eq!(slot.begins(), 0);
}

#[tokio::test]
async fn test_image_larger_than_slot_is_insufficient_space() {
    let http = FakeHttp::new().route("http://host/fw.bin", FakeResponse::ok(IMAGE));
    let slot = MemSlot::new(8);

    let result = checker(&http)
        .install_from("http://host/fw.bin", None, &mut installer(&slot))
        .await;

    assert!(matches!(
        result,
        Err(UpdateError::Install(InstallError::InsufficientSpace { expected, .. }))
            if expected == IMAGE.len() as u64
    ));
    assert!(slot.committed().is_none());
}

#[tokio::test]
async fn test_truncated_transfer_is_incomplete_write() {
    let http = FakeHttp::new().route(
        "http://host/fw.bin",
        FakeResponse {
            content_length: Some(IMAGE.len() as u64 + 10),
            ..FakeResponse::ok(IMAGE)
        },
    );
    let slot = MemSlot::new(1024);

    let result = checker(&http)
        .install_from("http://host/fw.bin", None, &mut installer(&slot))
        .await;

    assert_eq!(
        result,
        Err(UpdateError::Install(InstallError::IncompleteWrite {
            written: IMAGE.len() as u64,
            expected: IMAGE.len() as u64 + 10,
        }))
    );
    assert!(slot.committed().is_none());
    assert_eq!(slot.aborts(), 1);
}

#[tokio::test]
async fn test_lexicographic_ordering_by_default() {
    let http = FakeHttp::new().route(
        &version_url(),
        FakeResponse::ok(br#"{"version":"1.0.10","url":"1.0.10"}"#),
    );
    let slot = MemSlot::new(1024);
    let checker = UpdateChecker::new(
        Arc::new(http.clone()),
        checker::Options {
            api_url: API_URL.to_string(),
            current_version: "1.0.9".to_string(),
            ordering: VersionOrdering::Lexicographic,
        },
    );

    // "1.0.10" < "1.0.9" byte-wise
    let outcome = checker.check_for_update(&mut installer(&slot)).await;
    assert!(matches!(outcome, Ok(CheckOutcome::UpToDate { .. })));
}

#[tokio::test]
async fn test_numeric_ordering_when_configured() {
    let http = FakeHttp::new()
        .route(
            &version_url(),
            FakeResponse::ok(br#"{"version":"1.0.10","url":"1.0.10"}"#),
        )
        .route(&firmware_url("1.0.10"), FakeResponse::ok(IMAGE));
    let slot = MemSlot::new(1024);
    let checker = UpdateChecker::new(
        Arc::new(http.clone()),
        checker::Options {
            api_url: API_URL.to_string(),
            current_version: "1.0.9".to_string(),
            ordering: VersionOrdering::Numeric,
        },
    );

    let outcome = checker.check_for_update(&mut installer(&slot)).await;
    assert!(matches!(outcome, Ok(CheckOutcome::Installed(_))));
}
