//! Chunk planning — turns an asset's duration and size into request-sized windows.
//!
//! Three independent ceilings bound a chunk: wall-clock seconds, bytes (via the
//! asset's average byte rate) and tokens (via an assumed tokens-per-second
//! rate). The tightest one wins, floored at one second. Planning is pure so the
//! same inputs always reproduce the same manifest.

use scribeflow_core::{Asset, ChunkWindow, PlanningParams};
use tracing::debug;

/// Shortest chunk the planner will emit for time-based media.
pub const MIN_CHUNK_SECONDS: f64 = 1.0;
/// Residual tail below this is float noise, not a window.
const TAIL_EPSILON: f64 = 1e-6;
/// Admission cost assumed for whole-asset requests (documents, images).
pub const STATIC_ASSET_TOKEN_ESTIMATE: u64 = 1_000;

/// Effective chunk length `T_eff` for an asset of `duration` seconds and
/// `size_bytes` bytes. Non-positive ceilings are ignored. Returns infinity
/// when nothing bounds the chunk.
pub fn effective_chunk_seconds(duration: f64, size_bytes: u64, params: &PlanningParams) -> f64 {
    let mut limit = f64::INFINITY;

    if params.max_chunk_seconds.is_finite() && params.max_chunk_seconds > 0.0 {
        limit = limit.min(params.max_chunk_seconds);
    }

    if let Some(budget) = params.token_budget.filter(|b| *b > 0) {
        if params.tokens_per_second.is_finite() && params.tokens_per_second > 0.0 {
            limit = limit.min(budget as f64 / params.tokens_per_second);
        }
    }

    if params.max_chunk_bytes > 0 && size_bytes > 0 && duration > 0.0 {
        let bytes_per_second = size_bytes as f64 / duration;
        limit = limit.min(params.max_chunk_bytes as f64 / bytes_per_second);
    }

    limit.max(MIN_CHUNK_SECONDS)
}

/// Plan contiguous windows covering `[0, duration)`.
///
/// A zero duration yields a single zero-length window standing for the whole
/// asset. Boundaries are `index * T_eff`; the last window ends exactly at
/// `duration`.
pub fn plan_chunks(duration: f64, size_bytes: u64, params: &PlanningParams) -> Vec<ChunkWindow> {
    let duration = if duration.is_finite() && duration > 0.0 {
        duration
    } else {
        0.0
    };

    if duration == 0.0 {
        return vec![ChunkWindow {
            index: 0,
            start_seconds: 0.0,
            end_seconds: 0.0,
        }];
    }

    let step = effective_chunk_seconds(duration, size_bytes, params);
    if duration <= step {
        return vec![ChunkWindow {
            index: 0,
            start_seconds: 0.0,
            end_seconds: duration,
        }];
    }

    let full = (duration / step).floor();
    let remainder = duration - full * step;
    let count = if remainder < TAIL_EPSILON {
        full as usize
    } else {
        full as usize + 1
    }
    .max(1);

    let windows: Vec<ChunkWindow> = (0..count)
        .map(|index| ChunkWindow {
            index,
            start_seconds: index as f64 * step,
            end_seconds: if index + 1 == count {
                duration
            } else {
                (index + 1) as f64 * step
            },
        })
        .collect();

    debug!(
        "Planned {} chunks of {:.1}s for {:.1}s asset",
        windows.len(),
        step,
        duration
    );
    windows
}

/// Plan an asset. Non-time media always yields a single whole-asset window.
pub fn plan_for_asset(asset: &Asset, params: &PlanningParams) -> Vec<ChunkWindow> {
    let duration = if asset.modality.is_time_based() {
        asset.duration_seconds
    } else {
        0.0
    };
    plan_chunks(duration, asset.size_bytes, params)
}

/// Estimated token cost of sending `window` to the model.
pub fn estimate_tokens(window: &ChunkWindow, tokens_per_second: f64) -> u64 {
    if window.is_whole_asset() || !(tokens_per_second > 0.0) {
        return STATIC_ASSET_TOKEN_ESTIMATE;
    }
    ((window.length() * tokens_per_second).ceil() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribeflow_core::Modality;

    fn params(max_seconds: f64, budget: Option<u64>) -> PlanningParams {
        PlanningParams {
            model: "gemini-2.5-flash-lite".into(),
            token_budget: budget,
            tokens_per_second: 300.0,
            max_chunk_seconds: max_seconds,
            max_chunk_bytes: 0,
        }
    }

    fn assert_tiles(windows: &[ChunkWindow], duration: f64) {
        assert_eq!(windows[0].start_seconds, 0.0);
        for (i, pair) in windows.windows(2).enumerate() {
            assert_eq!(pair[0].index, i);
            assert_eq!(pair[0].end_seconds, pair[1].start_seconds);
            assert!(pair[0].start_seconds < pair[0].end_seconds);
        }
        assert_eq!(windows.last().unwrap().end_seconds, duration);
    }

    #[test]
    fn test_max_seconds_tiling() {
        let windows = plan_chunks(7300.0, 0, &params(3600.0, None));
        let bounds: Vec<(f64, f64)> = windows
            .iter()
            .map(|w| (w.start_seconds, w.end_seconds))
            .collect();
        assert_eq!(
            bounds,
            vec![(0.0, 3600.0), (3600.0, 7200.0), (7200.0, 7300.0)]
        );
    }

    #[test]
    fn test_token_budget_is_tighter() {
        // 300k tokens at 300 tok/s → 1000s chunks.
        let windows = plan_chunks(7300.0, 0, &params(3600.0, Some(300_000)));
        assert_eq!(windows.len(), 8);
        assert_tiles(&windows, 7300.0);
        assert!(windows.iter().all(|w| w.length() <= 1000.0));
        assert_eq!(windows[7].start_seconds, 7000.0);
        assert!(windows[7].length() < windows[0].length());
    }

    #[test]
    fn test_byte_ceiling() {
        // 1000 bytes/s with a 100k byte ceiling → 100s chunks.
        let mut p = params(3600.0, None);
        p.max_chunk_bytes = 100_000;
        let windows = plan_chunks(1000.0, 1_000_000, &p);
        assert_eq!(windows.len(), 10);
        assert_tiles(&windows, 1000.0);
    }

    #[test]
    fn test_zero_duration_is_whole_asset() {
        let windows = plan_chunks(0.0, 4096, &params(3600.0, Some(300_000)));
        assert_eq!(windows.len(), 1);
        assert!(windows[0].is_whole_asset());

        let windows = plan_chunks(f64::NAN, 4096, &params(3600.0, None));
        assert_eq!(windows.len(), 1);
        assert!(windows[0].is_whole_asset());
    }

    #[test]
    fn test_short_asset_single_window() {
        let windows = plan_chunks(42.5, 0, &params(3600.0, Some(300_000)));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].end_seconds, 42.5);

        // Exactly one chunk long.
        let windows = plan_chunks(3600.0, 0, &params(3600.0, None));
        assert_eq!(windows.len(), 1);
    }

    #[test]
    fn test_floor_of_one_second() {
        let windows = plan_chunks(5.0, 0, &params(0.1, None));
        assert_eq!(windows.len(), 5);
        assert_tiles(&windows, 5.0);
    }

    #[test]
    fn test_unbounded_params_single_window() {
        let p = PlanningParams {
            model: "m".into(),
            token_budget: None,
            tokens_per_second: 0.0,
            max_chunk_seconds: 0.0,
            max_chunk_bytes: 0,
        };
        let windows = plan_chunks(99_999.0, 1, &p);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].end_seconds, 99_999.0);
    }

    #[test]
    fn test_windows_always_tile_duration() {
        let durations = [1.0, 1.5, 59.9, 600.0, 3599.99, 7300.0, 10_001.25, 86_400.0];
        let ceilings = [1.0, 7.0, 60.0, 333.3, 1000.0, 3600.0];
        for &d in &durations {
            for &c in &ceilings {
                let windows = plan_chunks(d, 0, &params(c, None));
                assert_tiles(&windows, d);
                assert!(windows.iter().all(|w| w.length() <= c.max(1.0) + 1e-9));
                let covered: f64 = windows.iter().map(|w| w.length()).sum();
                assert!((covered - d).abs() < 1e-6, "d={d} c={c} covered={covered}");
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let p = params(3600.0, Some(300_000));
        assert_eq!(plan_chunks(7300.0, 10, &p), plan_chunks(7300.0, 10, &p));
    }

    #[test]
    fn test_plan_for_document_ignores_duration() {
        let asset = Asset {
            source: "notes.pdf".into(),
            modality: Modality::Document,
            duration_seconds: 120.0,
            size_bytes: 2048,
            fingerprint: "sha256:00".into(),
            normalized_fingerprint: None,
        };
        let windows = plan_for_asset(&asset, &params(10.0, None));
        assert_eq!(windows.len(), 1);
        assert!(windows[0].is_whole_asset());
    }

    #[test]
    fn test_estimate_tokens() {
        let window = ChunkWindow {
            index: 0,
            start_seconds: 0.0,
            end_seconds: 1000.0,
        };
        assert_eq!(estimate_tokens(&window, 300.0), 300_000);
        let whole = ChunkWindow {
            index: 0,
            start_seconds: 0.0,
            end_seconds: 0.0,
        };
        assert_eq!(estimate_tokens(&whole, 300.0), STATIC_ASSET_TOKEN_ESTIMATE);
    }
}
