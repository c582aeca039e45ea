//! Behavioural tests for the upload state machine against scripted doubles.

use std::time::Duration;

use hcloud_upload_image::remote::{CommandOutcome, RetryPolicy};
use hcloud_upload_image::request::parse_image_url;
use hcloud_upload_image::test_support::{
    FakeKeyGenerator, ProviderCall, RecordingEventSink, ScriptedProvider, ScriptedTransport,
    TransportStep,
};
use hcloud_upload_image::{
    Architecture, Compression, ExecutorSettings, ProvisionSettings, RemoteExecutor,
    ResourceProvisioner, RunIdentity, UploadEvent, UploadFailure, UploadOrchestrator,
    UploadRequest, UploadStage,
};
use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

type Orchestrator = UploadOrchestrator<ScriptedProvider, FakeKeyGenerator, ScriptedTransport>;

struct Harness {
    provider: ScriptedProvider,
    transport: ScriptedTransport,
    events: RecordingEventSink,
    orchestrator: Orchestrator,
}

#[fixture]
fn harness() -> Harness {
    let provider = ScriptedProvider::new();
    let transport = ScriptedTransport::new();
    let provisioner = ResourceProvisioner::new(
        provider.clone(),
        FakeKeyGenerator,
        ProvisionSettings {
            location: String::from("fsn1"),
            base_image: String::from("ubuntu-24.04"),
            rescue_type: String::from("linux64"),
        },
    );
    let executor = RemoteExecutor::new(
        transport.clone(),
        ExecutorSettings {
            user: String::from("root"),
            port: 22,
            connect_timeout: Duration::from_secs(1),
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        },
    );
    Harness {
        provider,
        transport,
        events: RecordingEventSink::default(),
        orchestrator: UploadOrchestrator::new(provisioner, executor),
    }
}

fn url_request() -> UploadRequest {
    UploadRequest::builder()
        .image_url(parse_image_url("https://example.com/image-x86.raw.xz").expect("url"))
        .compression(Compression::Xz)
        .architecture(Architecture::X86)
        .description(Some(String::from("custom linux")))
        .label("os", "custom")
        .build()
        .expect("valid request")
}

fn run_id() -> RunIdentity {
    RunIdentity::from_string("0a1b2c3d")
}

fn is_delete(call: &ProviderCall) -> bool {
    matches!(
        call,
        ProviderCall::DeleteServer(_) | ProviderCall::DeleteSshKey(_)
    )
}

fn deletions(provider: &ScriptedProvider) -> Vec<ProviderCall> {
    provider
        .calls()
        .into_iter()
        .filter(is_delete)
        .collect()
}

#[rstest]
#[tokio::test]
async fn url_upload_produces_labelled_snapshot_and_cleans_up(harness: Harness) {
    let image = harness
        .orchestrator
        .upload_as(
            run_id(),
            url_request(),
            &harness.events,
            &CancellationToken::new(),
        )
        .await
        .expect("upload succeeds");

    assert_eq!(image.status, "creating");
    assert_eq!(image.description.as_deref(), Some("custom linux"));
    assert_eq!(image.labels.get("os").map(String::as_str), Some("custom"));
    assert_eq!(
        image
            .labels
            .get("apricote.de/created-by")
            .map(String::as_str),
        Some("hcloud-upload-image")
    );

    let commands = harness.transport.commands();
    assert_eq!(commands.len(), 2, "commands: {commands:?}");
    assert!(commands.first().is_some_and(|cmd| cmd.contains("wget")
        && cmd.contains("xz -cd")
        && cmd.contains("dd of=/dev/sda")));
    assert_eq!(commands.last().map(String::as_str), Some("shutdown now"));

    let calls = harness.provider.calls();
    let Some(ProviderCall::CreateServer(spec)) = calls.get(1) else {
        panic!("expected create_server second, got {calls:?}");
    };
    assert_eq!(spec.name, "hcloud-upload-image-0a1b2c3d");
    assert_eq!(spec.server_type, "cx22");
    assert!(
        calls
            .iter()
            .any(|call| matches!(call, ProviderCall::EnableRescue(_, rescue, _) if rescue == "linux64"))
    );
    assert!(calls.iter().any(|call| matches!(call, ProviderCall::PowerOn(_))));

    assert!(harness.provider.server_ids().is_empty());
    assert!(harness.provider.ssh_key_ids().is_empty());
    assert_eq!(
        harness.events.names().last().copied(),
        Some("upload-completed")
    );
}

#[rstest]
#[tokio::test]
async fn local_stream_is_fed_to_the_write_command(harness: Harness) {
    let request = UploadRequest::builder()
        .image_reader(Box::new(std::io::Cursor::new(b"disk image".to_vec())))
        .architecture(Architecture::Arm)
        .build()
        .expect("valid request");

    harness
        .orchestrator
        .upload_as(run_id(), request, &harness.events, &CancellationToken::new())
        .await
        .expect("upload succeeds");

    assert_eq!(harness.transport.stdin_payloads(), vec![b"disk image".to_vec()]);
    let commands = harness.transport.commands();
    assert!(commands.first().is_some_and(|cmd| !cmd.contains("wget")));
}

#[rstest]
#[case::key(
    |provider: &ScriptedProvider, _: &ScriptedTransport| provider.fail_call("create_ssh_key"),
    UploadStage::KeyCreated,
    0
)]
#[case::machine(
    |provider: &ScriptedProvider, _: &ScriptedTransport| provider.fail_call("create_server"),
    UploadStage::MachineCreated,
    1
)]
#[case::rescue(
    |provider: &ScriptedProvider, _: &ScriptedTransport| provider.fail_wait_for("enable_rescue"),
    UploadStage::RescueEnabled,
    2
)]
#[case::boot(
    |provider: &ScriptedProvider, _: &ScriptedTransport| provider.fail_call("poweron"),
    UploadStage::Booted,
    2
)]
#[case::connect(
    |_: &ScriptedProvider, transport: &ScriptedTransport| transport.push_dial(TransportStep::Fatal),
    UploadStage::Connected,
    2
)]
#[case::write(
    |_: &ScriptedProvider, transport: &ScriptedTransport| transport.push_run(CommandOutcome {
        exit_code: Some(1),
        output: String::from("xz: (stdin): File format not recognized"),
        disconnected: false,
    }),
    UploadStage::ImageWritten,
    2
)]
#[case::snapshot(
    |provider: &ScriptedProvider, _: &ScriptedTransport| provider.fail_call("create_image"),
    UploadStage::Snapshotted,
    2
)]
#[tokio::test]
async fn failure_reports_stage_and_removes_resources_newest_first(
    harness: Harness,
    #[case] arrange: fn(&ScriptedProvider, &ScriptedTransport),
    #[case] stage: UploadStage,
    #[case] created: usize,
) {
    arrange(&harness.provider, &harness.transport);

    let err = harness
        .orchestrator
        .upload_as(
            run_id(),
            url_request(),
            &harness.events,
            &CancellationToken::new(),
        )
        .await
        .expect_err("upload fails");

    assert_eq!(err.stage, stage, "error: {err}");
    assert!(!err.is_cancelled());

    let deleted = deletions(&harness.provider);
    assert_eq!(deleted.len(), created, "deletions: {deleted:?}");
    if created == 2 {
        assert!(matches!(deleted.first(), Some(ProviderCall::DeleteServer(_))));
        assert!(matches!(deleted.last(), Some(ProviderCall::DeleteSshKey(_))));
    }
    assert!(harness.provider.server_ids().is_empty());
    assert!(harness.provider.ssh_key_ids().is_empty());
    assert_eq!(harness.events.names().last().copied(), Some("upload-failed"));
}

#[rstest]
#[tokio::test]
async fn write_failure_surfaces_remote_output(harness: Harness) {
    harness.transport.push_run(CommandOutcome {
        exit_code: Some(2),
        output: String::from("dd: error writing '/dev/sda'"),
        disconnected: false,
    });

    let err = harness
        .orchestrator
        .upload_as(
            run_id(),
            url_request(),
            &harness.events,
            &CancellationToken::new(),
        )
        .await
        .expect_err("write fails");

    assert!(matches!(err.source, UploadFailure::Execution(_)));
    assert!(harness.events.events().iter().any(|event| matches!(
        event,
        UploadEvent::RemoteOutput { output } if output.contains("dd: error writing")
    )));
    assert_eq!(harness.transport.commands().len(), 1);
}

#[rstest]
#[tokio::test]
async fn failed_shutdown_does_not_fail_the_upload(harness: Harness) {
    harness.transport.push_run(CommandOutcome {
        exit_code: Some(0),
        output: String::new(),
        disconnected: false,
    });
    harness.transport.push_run(CommandOutcome {
        exit_code: Some(1),
        output: String::from("Failed to talk to init daemon"),
        disconnected: false,
    });

    harness
        .orchestrator
        .upload_as(
            run_id(),
            url_request(),
            &harness.events,
            &CancellationToken::new(),
        )
        .await
        .expect("upload succeeds");

    assert!(harness.events.names().contains(&"shutdown-failed"));
}

#[rstest]
#[tokio::test]
async fn dropped_connection_during_shutdown_is_expected(harness: Harness) {
    harness.transport.push_run(CommandOutcome {
        exit_code: Some(0),
        output: String::new(),
        disconnected: false,
    });
    harness.transport.push_run(CommandOutcome {
        exit_code: Some(255),
        output: String::from("Connection closed by remote host"),
        disconnected: true,
    });

    harness
        .orchestrator
        .upload_as(
            run_id(),
            url_request(),
            &harness.events,
            &CancellationToken::new(),
        )
        .await
        .expect("upload succeeds");

    assert!(!harness.events.names().contains(&"shutdown-failed"));
}

#[rstest]
#[tokio::test]
async fn connection_is_retried_until_rescue_system_answers(harness: Harness) {
    harness.transport.push_dial(TransportStep::Retryable);
    harness.transport.push_dial(TransportStep::Retryable);

    harness
        .orchestrator
        .upload_as(
            run_id(),
            url_request(),
            &harness.events,
            &CancellationToken::new(),
        )
        .await
        .expect("upload succeeds");

    assert_eq!(harness.transport.dial_count(), 3);
    let retries = harness
        .events
        .names()
        .into_iter()
        .filter(|name| *name == "retry-scheduled")
        .count();
    assert_eq!(retries, 2);
}

#[rstest]
#[tokio::test]
async fn skip_cleanup_leaves_resources_in_place(harness: Harness) {
    harness.provider.fail_call("create_image");
    let request = UploadRequest::builder()
        .image_url(parse_image_url("https://example.com/image.raw").expect("url"))
        .architecture(Architecture::X86)
        .skip_cleanup(true)
        .build()
        .expect("valid request");

    let err = harness
        .orchestrator
        .upload_as(run_id(), request, &harness.events, &CancellationToken::new())
        .await
        .expect_err("snapshot fails");

    assert_eq!(err.stage, UploadStage::Snapshotted);
    assert!(deletions(&harness.provider).is_empty());
    assert_eq!(harness.provider.server_ids().len(), 1);
    assert_eq!(harness.provider.ssh_key_ids().len(), 1);
    assert!(harness.events.events().iter().any(|event| matches!(
        event,
        UploadEvent::CleanupSkipped { resources } if resources.len() == 2
    )));
}

#[rstest]
#[tokio::test]
async fn cleanup_failure_does_not_mask_the_upload_error(harness: Harness) {
    harness.provider.fail_wait_for("enable_rescue");
    // The key is the first resource the scripted provider numbers.
    harness.provider.fail_delete_ssh_key(1);

    let err = harness
        .orchestrator
        .upload_as(
            run_id(),
            url_request(),
            &harness.events,
            &CancellationToken::new(),
        )
        .await
        .expect_err("rescue fails");

    assert_eq!(err.stage, UploadStage::RescueEnabled);
    assert!(harness.events.names().contains(&"cleanup-failed"));
    assert!(harness.provider.server_ids().is_empty());
    assert_eq!(harness.provider.ssh_key_ids(), vec![1]);
}

#[rstest]
#[tokio::test]
async fn cleanup_failure_does_not_fail_a_successful_upload(harness: Harness) {
    harness.provider.fail_delete_ssh_key(1);

    harness
        .orchestrator
        .upload_as(
            run_id(),
            url_request(),
            &harness.events,
            &CancellationToken::new(),
        )
        .await
        .expect("upload succeeds");

    assert!(harness.events.names().contains(&"cleanup-failed"));
}

#[rstest]
#[tokio::test]
async fn resources_already_deleted_do_not_warn(harness: Harness) {
    harness.provider.vanish_on_delete(1);

    harness
        .orchestrator
        .upload_as(
            run_id(),
            url_request(),
            &harness.events,
            &CancellationToken::new(),
        )
        .await
        .expect("upload succeeds");

    assert!(!harness.events.names().contains(&"cleanup-failed"));
    assert!(harness.provider.ssh_key_ids().is_empty());
}

#[rstest]
#[tokio::test]
async fn cancellation_during_wait_still_cleans_up(harness: Harness) {
    let cancel = CancellationToken::new();
    harness.provider.cancel_on_wait("enable_rescue", cancel.clone());

    let err = harness
        .orchestrator
        .upload_as(run_id(), url_request(), &harness.events, &cancel)
        .await
        .expect_err("cancelled");

    assert!(err.is_cancelled(), "error: {err}");
    assert_eq!(err.stage, UploadStage::RescueEnabled);
    assert!(harness.provider.server_ids().is_empty());
    assert!(harness.provider.ssh_key_ids().is_empty());
}

#[rstest]
#[tokio::test]
async fn cancellation_during_write_still_cleans_up(harness: Harness) {
    harness.transport.push_hang();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = harness
        .orchestrator
        .upload_as(run_id(), url_request(), &harness.events, &cancel)
        .await
        .expect_err("cancelled");

    assert!(err.is_cancelled(), "error: {err}");
    assert_eq!(err.stage, UploadStage::ImageWritten);
    assert_eq!(deletions(&harness.provider).len(), 2);
    assert!(harness.transport.closed_sessions() >= 1);
}

#[rstest]
#[tokio::test]
async fn unsupported_compression_fails_before_any_provider_call(harness: Harness) {
    let request = UploadRequest::builder()
        .image_url(parse_image_url("https://example.com/image.raw.zst").expect("url"))
        .compression(Compression::Zstd)
        .architecture(Architecture::X86)
        .build()
        .expect("valid request");

    let err = harness
        .orchestrator
        .upload_as(run_id(), request, &harness.events, &CancellationToken::new())
        .await
        .expect_err("unsupported");

    assert_eq!(err.stage, UploadStage::Init);
    assert!(matches!(err.source, UploadFailure::Validation(_)));
    assert!(harness.provider.calls().is_empty());
    assert_eq!(harness.events.names(), vec!["upload-started", "upload-failed"]);
}
