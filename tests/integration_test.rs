use std::sync::Arc;

use futures_util::future::join_all;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

use rmbg_rs::mocks::{create_mock_model, MockFetcher, MockSegmentationModel};
use rmbg_rs::pipeline::encode;
use rmbg_rs::{
    ArtifactCache, ArtifactStatus, ErrorKind, ImageRequest, InferencePipeline, ModelArtifact,
    RequestOrchestrator, SegmentOptions,
};

// 統合テスト用の構成一式
struct Harness {
    _dir: TempDir,
    artifact: ModelArtifact,
    fetcher: Arc<MockFetcher>,
    cache: Arc<ArtifactCache>,
    orchestrator: Arc<RequestOrchestrator<MockSegmentationModel>>,
}

fn harness(delay_ms: u64, workers: usize) -> anyhow::Result<Harness> {
    let dir = TempDir::new()?;
    let artifact = ModelArtifact::new(
        dir.path().join("cache").join("u2net.onnx"),
        "http://models.invalid/u2net.onnx",
    );
    let fetcher = MockFetcher::new(delay_ms);
    let cache = Arc::new(ArtifactCache::new(artifact.clone(), fetcher.clone()));
    let pipeline = InferencePipeline::new(create_mock_model(), SegmentOptions::default());
    let orchestrator = Arc::new(RequestOrchestrator::new(
        Arc::clone(&cache),
        pipeline,
        workers,
    ));
    Ok(Harness {
        _dir: dir,
        artifact,
        fetcher,
        cache,
        orchestrator,
    })
}

fn opaque_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        if (x + y) % 3 == 0 {
            Rgb([240, 240, 240])
        } else {
            Rgb([30, 60, 90])
        }
    });
    encode(&DynamicImage::ImageRgb8(image)).unwrap()
}

#[tokio::test]
async fn test_provisioning_is_idempotent() -> anyhow::Result<()> {
    let h = harness(0, 1)?;

    for _ in 0..10 {
        h.cache.ensure_ready().await?;
    }
    assert_eq!(h.fetcher.calls(), 1);
    assert_eq!(h.cache.status(), ArtifactStatus::Ready);
    assert!(h.artifact.path.is_file());
    assert!(!h.artifact.partial_path().exists());

    // 既にファイルがある新しいキャッシュはダウンロードしない
    let fresh_fetcher = MockFetcher::new(0);
    let fresh = ArtifactCache::new(h.artifact.clone(), fresh_fetcher.clone());
    fresh.ensure_ready().await?;
    assert_eq!(fresh_fetcher.calls(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_start_fetches_once() -> anyhow::Result<()> {
    let h = harness(80, 4)?;
    let input = opaque_png(9, 6);

    let requests = (0..12).map(|i| {
        let orchestrator = Arc::clone(&h.orchestrator);
        let bytes = input.clone();
        tokio::spawn(async move {
            orchestrator
                .handle_upload(Some(ImageRequest::new(format!("img{i}.png"), bytes)))
                .await
        })
    });

    for outcome in join_all(requests).await {
        outcome??;
    }
    assert_eq!(h.fetcher.calls(), 1);
    assert_eq!(h.orchestrator.pipeline().model().calls(), 12);
    Ok(())
}

#[tokio::test]
async fn test_round_trip_keeps_dimensions_and_adds_alpha() -> anyhow::Result<()> {
    let h = harness(0, 1)?;
    h.orchestrator.prepare().await?;

    let result = h
        .orchestrator
        .handle_upload(Some(ImageRequest::new("scene.jpg", opaque_png(31, 17))))
        .await?;

    let output = image::load_from_memory_with_format(&result.png, ImageFormat::Png)?;
    assert_eq!(output.dimensions(), (31, 17));
    assert!(output.color().has_alpha());
    assert_eq!(result.filename, "scene_rmbg.png");
    Ok(())
}

#[tokio::test]
async fn test_empty_input_is_rejected_before_any_work() -> anyhow::Result<()> {
    let h = harness(0, 1)?;

    let err = h.orchestrator.handle_upload(None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingInput);

    let err = h
        .orchestrator
        .handle_upload(Some(ImageRequest {
            filename: None,
            bytes: opaque_png(2, 2),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingInput);

    assert_eq!(h.fetcher.calls(), 0);
    assert_eq!(h.cache.status(), ArtifactStatus::Absent);
    assert_eq!(h.orchestrator.pipeline().model().calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_input_never_reaches_segmentation() -> anyhow::Result<()> {
    let h = harness(0, 1)?;

    let err = h
        .orchestrator
        .handle_upload(Some(ImageRequest::new("broken.png", b"\x89PNG garbage".to_vec())))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert_eq!(h.orchestrator.pipeline().model().calls(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_provisioning_failure_reaches_every_caller() -> anyhow::Result<()> {
    let h = harness(50, 2)?;
    h.fetcher.set_failing(true);
    let input = opaque_png(4, 4);

    let requests = (0..6).map(|i| {
        let orchestrator = Arc::clone(&h.orchestrator);
        let bytes = input.clone();
        tokio::spawn(async move {
            orchestrator
                .handle_upload(Some(ImageRequest::new(format!("{i}.png"), bytes)))
                .await
        })
    });
    for outcome in join_all(requests).await {
        let err = outcome?.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provisioning);
    }
    assert_eq!(h.fetcher.calls(), 1);
    assert!(!h.artifact.path.exists());
    assert!(!h.artifact.partial_path().exists());
    assert_eq!(h.orchestrator.pipeline().model().calls(), 0);

    // 失敗が続く間は後続のリクエストも失敗する
    let err = h
        .orchestrator
        .handle_upload(Some(ImageRequest::new("later.png", input.clone())))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provisioning);
    assert_eq!(h.fetcher.calls(), 2);

    h.fetcher.set_failing(false);
    h.orchestrator
        .handle_upload(Some(ImageRequest::new("recovered.png", input)))
        .await?;
    assert_eq!(h.fetcher.calls(), 3);
    assert_eq!(h.cache.status(), ArtifactStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn test_timing_does_not_change_output() -> anyhow::Result<()> {
    let h = harness(0, 1)?;
    let input = opaque_png(23, 11);

    let result = h
        .orchestrator
        .handle_upload(Some(ImageRequest::new("same.png", input.clone())))
        .await?;
    let untimed = h.orchestrator.pipeline().process(&input)?;

    assert_eq!(result.png, untimed);
    Ok(())
}
