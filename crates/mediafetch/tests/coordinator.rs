mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use parking_lot::Mutex;

use common::{TestServer, init_tracing, payload, test_config};
use mediafetch::{
    DownloadCoordinator, EngineError, ErrorKind, FormatGroup, MergeRequest, Postprocessor,
    StreamDescriptor, TrackType,
};

/// Concatenates its inputs in order and remembers every request.
#[derive(Default)]
struct ConcatMerger {
    requests: Mutex<Vec<MergeRequest>>,
}

#[async_trait]
impl Postprocessor for ConcatMerger {
    async fn merge(&self, request: &MergeRequest) -> Result<(), EngineError> {
        let mut merged = Vec::new();
        for input in &request.inputs {
            merged.extend(tokio::fs::read(&input.path).await?);
        }
        tokio::fs::write(&request.output_path, merged).await?;
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

fn progressive(
    server: &TestServer,
    id: &str,
    track: TrackType,
    container: &str,
) -> Arc<StreamDescriptor> {
    Arc::new(
        StreamDescriptor::progressive(id, server.url(&format!("/{id}")), track)
            .with_container(container),
    )
}

#[tokio::test]
async fn single_stream_is_promoted() {
    init_tracing();
    let server = TestServer::start().await;
    let data = payload(150_000, 1);
    server.add("/18", data.clone());

    let dir = tempfile::tempdir().unwrap();
    let coordinator = DownloadCoordinator::from_config(test_config(dir.path())).unwrap();
    let groups = vec![FormatGroup::single(progressive(
        &server,
        "18",
        TrackType::Combined,
        "mp4",
    ))];

    let artifact = coordinator.run("abc123", &groups).await.unwrap();

    assert_eq!(artifact.path, dir.path().join("out").join("abc123.mp4"));
    assert_eq!(artifact.container, "mp4");
    assert_eq!(artifact.size, data.len() as u64);
    assert_eq!(artifact.streams.len(), 1);
    assert_eq!(artifact.streams[0].id, "18");
    assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), data);
    assert!(!coordinator.layout().group_dir("abc123", 0).exists());
}

#[tokio::test]
async fn video_and_audio_are_merged() {
    let server = TestServer::start().await;
    let video = payload(90_000, 2);
    let audio = payload(30_000, 3);
    server.add("/137", video.clone());
    server.add("/140", audio.clone());

    let dir = tempfile::tempdir().unwrap();
    let merger = Arc::new(ConcatMerger::default());
    let coordinator = DownloadCoordinator::from_config(test_config(dir.path()))
        .unwrap()
        .with_postprocessor(merger.clone());
    let groups = vec![
        FormatGroup::new(vec![
            progressive(&server, "137", TrackType::Video, "mp4"),
            progressive(&server, "140", TrackType::Audio, "m4a"),
        ])
        .unwrap(),
    ];

    let artifact = coordinator.run("abc123", &groups).await.unwrap();

    assert_eq!(artifact.path, dir.path().join("out").join("abc123.mp4"));
    assert_eq!(artifact.streams.len(), 2);
    let expected: Vec<u8> = [video, audio].concat();
    assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), expected);

    let requests = merger.requests.lock();
    assert_eq!(requests.len(), 1);
    let ids: Vec<&str> = requests[0]
        .inputs
        .iter()
        .map(|i| i.stream.id.as_str())
        .collect();
    assert_eq!(ids, ["137", "140"]);
    assert_eq!(requests[0].container, "mp4");
    assert!(!coordinator.layout().group_dir("abc123", 0).exists());
}

#[tokio::test]
async fn failed_group_falls_back_to_next_candidate() {
    let server = TestServer::start().await;
    let data = payload(20_000, 4);
    server.add("/22", payload(10, 0));
    server.always_fail("/22", StatusCode::FORBIDDEN);
    server.add("/18", data.clone());

    let dir = tempfile::tempdir().unwrap();
    let coordinator = DownloadCoordinator::from_config(test_config(dir.path())).unwrap();
    let groups = vec![
        FormatGroup::single(progressive(&server, "22", TrackType::Combined, "mp4")),
        FormatGroup::single(progressive(&server, "18", TrackType::Combined, "mp4")),
    ];

    let artifact = coordinator.run("abc123", &groups).await.unwrap();

    assert_eq!(artifact.streams[0].id, "18");
    assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), data);
    assert_eq!(server.request_count("/22"), 1);
}

#[tokio::test]
async fn failed_member_stops_its_siblings() {
    let server = TestServer::start().await;
    let video = payload(512 * 1024, 2);
    let combined = payload(20_000, 4);
    server.add("/137", video.clone());
    server.pace("/137", Duration::from_millis(20));
    server.add("/140", payload(10, 0));
    server.always_fail("/140", StatusCode::FORBIDDEN);
    server.add("/18", combined.clone());

    let dir = tempfile::tempdir().unwrap();
    let coordinator = DownloadCoordinator::from_config(test_config(dir.path()))
        .unwrap()
        .with_postprocessor(Arc::new(ConcatMerger::default()));
    let groups = vec![
        FormatGroup::new(vec![
            progressive(&server, "137", TrackType::Video, "mp4"),
            progressive(&server, "140", TrackType::Audio, "m4a"),
        ])
        .unwrap(),
        FormatGroup::single(progressive(&server, "18", TrackType::Combined, "mp4")),
    ];

    let artifact = coordinator.run("abc123", &groups).await.unwrap();

    assert_eq!(artifact.streams[0].id, "18");
    assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), combined);
    // The paced video was abandoned partway and stays staged for a resume.
    let staging = coordinator
        .layout()
        .staging_path("abc123", 0, &groups[0].members()[0]);
    let staged = tokio::fs::metadata(&staging)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    assert!(staged < video.len() as u64);
}

#[tokio::test]
async fn merge_without_postprocessor_falls_back() {
    let server = TestServer::start().await;
    let combined = payload(40_000, 5);
    server.add("/137", payload(1_000, 6));
    server.add("/140", payload(1_000, 7));
    server.add("/18", combined.clone());

    let dir = tempfile::tempdir().unwrap();
    let coordinator = DownloadCoordinator::from_config(test_config(dir.path())).unwrap();
    let groups = vec![
        FormatGroup::new(vec![
            progressive(&server, "137", TrackType::Video, "mp4"),
            progressive(&server, "140", TrackType::Audio, "m4a"),
        ])
        .unwrap(),
        FormatGroup::single(progressive(&server, "18", TrackType::Combined, "mp4")),
    ];

    let artifact = coordinator.run("abc123", &groups).await.unwrap();

    assert_eq!(artifact.streams[0].id, "18");
    assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), combined);
}

#[tokio::test]
async fn all_groups_failing_reports_every_member() {
    let server = TestServer::start().await;
    server.add("/137", payload(10, 0));
    server.add("/140", payload(10, 0));
    server.add("/18", payload(10, 0));
    server.always_fail("/137", StatusCode::NOT_FOUND);
    server.always_fail("/18", StatusCode::NOT_FOUND);

    let dir = tempfile::tempdir().unwrap();
    let coordinator = DownloadCoordinator::from_config(test_config(dir.path()))
        .unwrap()
        .with_postprocessor(Arc::new(ConcatMerger::default()));
    let groups = vec![
        FormatGroup::new(vec![
            progressive(&server, "137", TrackType::Video, "mp4"),
            progressive(&server, "140", TrackType::Audio, "m4a"),
        ])
        .unwrap(),
        FormatGroup::single(progressive(&server, "18", TrackType::Combined, "mp4")),
    ];

    let err = coordinator.run("abc123", &groups).await.unwrap_err();

    let EngineError::DownloadFailed {
        failed_members,
        fallback_available,
    } = err
    else {
        panic!("expected DownloadFailed, got {err:?}");
    };
    assert!(!fallback_available);
    let failed: Vec<(usize, &str)> = failed_members
        .iter()
        .map(|m| (m.group_index, m.descriptor_id.as_str()))
        .collect();
    assert_eq!(failed, [(0, "137"), (1, "18")]);
    assert!(
        failed_members
            .iter()
            .all(|m| m.kind == ErrorKind::ServerRejected)
    );
}

#[tokio::test]
async fn single_group_run_reports_remaining_fallbacks() {
    let server = TestServer::start().await;
    server.add("/22", payload(10, 0));
    server.always_fail("/22", StatusCode::GONE);
    server.add("/18", payload(10, 0));

    let dir = tempfile::tempdir().unwrap();
    let coordinator = DownloadCoordinator::from_config(test_config(dir.path())).unwrap();
    let groups = vec![
        FormatGroup::single(progressive(&server, "22", TrackType::Combined, "mp4")),
        FormatGroup::single(progressive(&server, "18", TrackType::Combined, "mp4")),
    ];

    let err = coordinator.run_group("abc123", &groups, 0).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::DownloadFailed {
            fallback_available: true,
            ..
        }
    ));
    assert_eq!(server.request_count("/18"), 0);
}

#[tokio::test]
async fn job_timeout_fails_the_group() {
    let server = TestServer::start().await;
    server.add("/18", payload(512 * 1024, 8));
    server.pace("/18", Duration::from_millis(100));

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.job_timeout_secs = Some(1);
    let coordinator = DownloadCoordinator::from_config(config).unwrap();
    let groups = vec![FormatGroup::single(progressive(
        &server,
        "18",
        TrackType::Combined,
        "mp4",
    ))];

    let err = coordinator.run("abc123", &groups).await.unwrap_err();

    let EngineError::DownloadFailed { failed_members, .. } = err else {
        panic!("expected DownloadFailed, got {err:?}");
    };
    assert_eq!(failed_members.len(), 1);
    assert_eq!(failed_members[0].kind, ErrorKind::JobTimeout);
    // Partial data stays staged for a later run.
    let staging = coordinator
        .layout()
        .staging_path("abc123", 0, &groups[0].members()[0]);
    assert!(tokio::fs::metadata(&staging).await.unwrap().len() > 0);
}

#[tokio::test]
async fn cancellation_pauses_and_rerun_resumes() {
    init_tracing();
    let server = TestServer::start().await;
    let data = payload(512 * 1024, 9);
    server.add("/18", data.clone());
    server.pace("/18", Duration::from_millis(20));

    let dir = tempfile::tempdir().unwrap();
    let coordinator = DownloadCoordinator::from_config(test_config(dir.path())).unwrap();
    let groups = vec![FormatGroup::single(progressive(
        &server,
        "18",
        TrackType::Combined,
        "mp4",
    ))];

    let token = coordinator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });
    let err = coordinator.run("abc123", &groups).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));

    let staging = coordinator
        .layout()
        .staging_path("abc123", 0, &groups[0].members()[0]);
    let staged = tokio::fs::metadata(&staging).await.unwrap().len();
    assert!(staged > 0);

    let coordinator = DownloadCoordinator::from_config(test_config(dir.path())).unwrap();
    let artifact = coordinator.run("abc123", &groups).await.unwrap();

    assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), data);
    let requests = server.requests_for("/18");
    assert_eq!(
        requests.last().unwrap().range.as_deref(),
        Some(format!("bytes={staged}-").as_str())
    );
}
