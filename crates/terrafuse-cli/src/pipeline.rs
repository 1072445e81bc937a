//! Frame-by-frame fusion: transform → page → rasterize → fuse.

use terrafuse_map::{DemFusionEngine, SwapOutcome, TileStore};
use terrafuse_perception::PointCloudTransformer;
use tracing::{info, warn};

use crate::frame::Frame;

/// Totals over a run of frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: usize,
    pub points: usize,
    pub binned: usize,
    pub adopted: usize,
    pub combined: usize,
    pub skipped: usize,
    pub swaps: usize,
}

/// Run one frame through the pipeline.
pub fn fuse_frame<S: TileStore>(
    engine: &mut DemFusionEngine<S>,
    transformer: &mut PointCloudTransformer,
    frame: &Frame,
    summary: &mut RunSummary,
) -> Result<(), String> {
    transformer
        .set_sensor_pose(frame.sensor_to_robot)
        .map_err(|e| format!("sensor_to_robot: {e}"))?;
    transformer
        .set_robot_pose(frame.robot_to_world)
        .map_err(|e| format!("robot_to_world: {e}"))?;
    transformer
        .set_point_cloud(frame.cloud(), frame.point_count())
        .map_err(|e| e.to_string())?;
    transformer.transform();

    let rover = frame.robot_to_world.translation;
    let swap = engine.update_position(rover.x, rover.y).map_err(|e| e.to_string())?;
    if let SwapOutcome::Swapped { from, to } = swap {
        info!(%from, %to, "rover changed tile");
        summary.swaps += 1;
    }

    let points = transformer.take_points();
    let raster = engine.rasterize(&points).map_err(|e| e.to_string())?;
    let stats = engine.fuse().map_err(|e| e.to_string())?;

    summary.frames += 1;
    summary.points += raster.points;
    summary.binned += raster.binned;
    summary.adopted += stats.adopted;
    summary.combined += stats.combined;
    summary.skipped += stats.skipped;
    Ok(())
}

/// Fuse every frame in order, then write the current tile back.
///
/// Stops at the first failing frame; whatever was fused before it is still
/// flushed.
pub fn fuse_frames<S: TileStore>(
    engine: &mut DemFusionEngine<S>,
    transformer: &mut PointCloudTransformer,
    frames: impl IntoIterator<Item = Result<Frame, String>>,
) -> Result<RunSummary, String> {
    let mut summary = RunSummary::default();
    let mut outcome = Ok(());
    for frame in frames {
        outcome = frame.and_then(|f| fuse_frame(engine, transformer, &f, &mut summary));
        if outcome.is_err() {
            break;
        }
    }

    match engine.flush() {
        Ok(_) => {}
        Err(e) if outcome.is_err() => warn!(error = %e, "flush after failed frame also failed"),
        Err(e) => return Err(format!("flush failed: {e}")),
    }
    outcome.map(|()| summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use terrafuse_map::{MapConfig, SqliteTileStore};
    use terrafuse_types::{CellState, TileId};

    fn frame(rover_x: f64, points: &str) -> Frame {
        Frame::parse(&format!(
            r#"{{
                "sensor_to_robot": {{ "translation": {{"x": 0.0, "y": 0.0, "z": 1.0}},
                                      "rotation": {{"w": 1.0, "x": 0.0, "y": 0.0, "z": 0.0}} }},
                "robot_to_world":  {{ "translation": {{"x": {rover_x}, "y": 0.5, "z": 0.0}},
                                      "rotation": {{"w": 1.0, "x": 0.0, "y": 0.0, "z": 0.0}} }},
                "points": {points}
            }}"#
        ))
        .unwrap()
    }

    fn engine() -> DemFusionEngine<SqliteTileStore> {
        let cfg = MapConfig {
            scale: 1.0,
            swap_window: 0,
            ..MapConfig::default()
        };
        let mut engine = DemFusionEngine::new(cfg, SqliteTileStore::open_in_memory().unwrap());
        engine.init(4, 4).unwrap();
        engine
    }

    #[test]
    fn frames_are_fused_into_world_frame() {
        let mut engine = engine();
        let mut tf = PointCloudTransformer::new("base_link", "world");
        // Sensor 1 m up, rover at (0.5, 0.5): point (1, 1, -1) lands at (1.5, 1.5, 0).
        let frames = vec![Ok(frame(0.5, "[[1.0, 1.0, -1.0, 0.0]]"))];

        let summary = fuse_frames(&mut engine, &mut tf, frames).unwrap();
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.adopted, 1);

        let tile = engine.store().load(TileId::new(0, 0)).unwrap();
        let cell = tile.cells().get(1, 1).unwrap();
        assert_eq!(cell.state, CellState::Observed);
        assert!(cell.elevation.abs() < 1e-6);
    }

    #[test]
    fn crossing_tiles_counts_swaps() {
        let mut engine = engine();
        let mut tf = PointCloudTransformer::new("base_link", "world");
        let frames = vec![
            Ok(frame(0.5, "[[0.0, 0.0, 0.0]]")),
            Ok(frame(4.5, "[[0.0, 0.0, 0.0]]")),
        ];
        let summary = fuse_frames(&mut engine, &mut tf, frames).unwrap();
        assert_eq!(summary.swaps, 1);
        assert!(engine.store().exists(TileId::new(0, 0)).unwrap());
        assert!(engine.store().exists(TileId::new(1, 0)).unwrap());
    }

    #[test]
    fn failing_frame_stops_run_but_keeps_earlier_work() {
        let mut engine = engine();
        let mut tf = PointCloudTransformer::new("base_link", "world");
        let frames = vec![
            Ok(frame(0.5, "[[0.0, 0.0, 0.0]]")),
            Err("Failed to parse frame broken.json".to_string()),
            Ok(frame(0.5, "[[1.0, 0.0, 0.0]]")),
        ];
        let err = fuse_frames(&mut engine, &mut tf, frames).unwrap_err();
        assert!(err.contains("broken.json"));
        let tile = engine.store().load(TileId::new(0, 0)).unwrap();
        assert_eq!(tile.cells().count_state(CellState::Observed), 1);
    }

    #[test]
    fn degenerate_pose_is_reported() {
        let mut engine = engine();
        let mut tf = PointCloudTransformer::new("base_link", "world");
        let mut bad = frame(0.5, "[]");
        bad.robot_to_world.rotation.w = 0.0;
        let err = fuse_frames(&mut engine, &mut tf, vec![Ok(bad)]).unwrap_err();
        assert!(err.starts_with("robot_to_world"));
    }
}
