//! Integration tests for the decode pool feeding the frame cache.
//!
//! Exercises proedit-playback's pool, cache and lookahead over
//! proedit-core frame handles.

use proedit_core::{DecodedImage, FrameRate, Result};
use proedit_playback::{
    CacheKey, Clip, DecodeRequest, DecodeWorkerPool, DecodedFrame, FrameCache, FrameQueue,
    PoolConfig, SourceRef, TestPatternDecoder,
};
use std::sync::Arc;

const WIDTH: u32 = 320;
const HEIGHT: u32 = 180;

// ── Helpers ────────────────────────────────────────────────────

async fn pool(workers: usize) -> DecodeWorkerPool {
    let config = PoolConfig {
        worker_count: workers,
        ..PoolConfig::default()
    };
    DecodeWorkerPool::initialize(config, Arc::new(TestPatternDecoder::new(FrameRate::FPS_30)))
        .await
        .unwrap()
}

fn ten_second_clip() -> Clip {
    Clip::new(SourceRef::new("media/ten_seconds.mp4"), 0, 0.0, 0.0, 10.0)
}

fn first_second() -> Vec<f64> {
    (0..30).map(|frame| frame as f64 / 30.0).collect()
}

/// Cache first, decode on a miss.
async fn fetch(
    pool: &DecodeWorkerPool,
    cache: &FrameCache,
    clip: &Clip,
    time: f64,
) -> Result<DecodedImage> {
    let key = CacheKey::at(clip.source.media_id, time, FrameRate::FPS_30);
    if let Some(image) = cache.get(&key) {
        return Ok(image);
    }
    let request = DecodeRequest::new(clip.id, clip.source.clone(), time, WIDTH, HEIGHT);
    let image = pool.decode_frame(request).await?;
    cache.set(key, image.clone());
    Ok(image)
}

// ── End-to-end cache behaviour ─────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_pass_misses_second_pass_hits() {
    let pool = pool(3).await;
    let cache = FrameCache::new(100, 50 * 1024 * 1024);
    let clip = ten_second_clip();

    for time in first_second() {
        fetch(&pool, &cache, &clip, time).await.unwrap();
    }
    let first = cache.stats();
    assert_eq!(first.entries, 30);
    assert_eq!(first.evictions, 0);
    assert_eq!(first.hits, 0);
    assert_eq!(first.misses, 30);

    cache.reset_stats();
    for time in first_second() {
        fetch(&pool, &cache, &clip, time).await.unwrap();
    }
    let second = cache.stats();
    assert_eq!(second.hits, 30);
    assert_eq!(second.misses, 0);
    assert_eq!(second.hit_rate, 1.0);
    assert_eq!(pool.stats().completed, 30);
    pool.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn byte_budget_bounds_the_cache() {
    let pool = pool(2).await;
    let cache = FrameCache::new(100, 1024 * 1024);
    let clip = ten_second_clip();

    for time in first_second() {
        fetch(&pool, &cache, &clip, time).await.unwrap();
    }
    let stats = cache.stats();
    let frame_bytes = (WIDTH * HEIGHT * 4) as usize;
    assert!(stats.size_bytes <= 1024 * 1024);
    assert_eq!(stats.entries, 1024 * 1024 / frame_bytes);
    assert_eq!(stats.evictions as usize, 30 - stats.entries);
    pool.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidating_a_clip_releases_its_frames() {
    let pool = pool(2).await;
    let cache = FrameCache::new(100, 50 * 1024 * 1024);
    let clip = ten_second_clip();

    let image = fetch(&pool, &cache, &clip, 0.5).await.unwrap();
    let watch = image.watch();
    drop(image);
    assert!(!watch.is_released());

    assert_eq!(cache.clear_for(clip.source.media_id), 1);
    assert_eq!(pool.clear_clip(clip.id), 1);
    assert!(watch.is_released());
    pool.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_decodes_land_in_timeline_order() {
    let pool = Arc::new(pool(3).await);
    let clip = ten_second_clip();

    let mut tasks = tokio::task::JoinSet::new();
    for (frame, time) in first_second().into_iter().enumerate().rev() {
        let pool = Arc::clone(&pool);
        let request = DecodeRequest::new(clip.id, clip.source.clone(), time, 64, 4);
        tasks.spawn(async move {
            let image = pool.decode_frame(request).await?;
            Ok::<_, proedit_core::ProEditError>(DecodedFrame::new(image, time, frame as i64))
        });
    }

    let mut queue = FrameQueue::new(30);
    while let Some(joined) = tasks.join_next().await {
        queue.insert(joined.unwrap().unwrap().on_track(0, clip.id));
    }
    let order: Vec<i64> = queue.iter().map(|f| f.frame_number).collect();
    assert_eq!(order, (0..30).collect::<Vec<_>>());

    let due = queue.select_at(0.5);
    assert_eq!(due[0].frame_number, 15);
    assert_eq!(due[0].image.buffer().pixels(0)[15], [15, 0, 128, 255]);
    pool.dispose();
}
