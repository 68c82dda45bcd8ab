//! Headless grass simulation.
//!
//! Builds a noise-driven landscape, flies a camera across it and drives the
//! grass scheduler into an in-memory sink, logging what it does.
//!
//! Usage: cargo run --release --bin grass_sim -- --tiles 4 --frames 600 [--config grass.json]

use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};

use landscape_grass::core::types::Vec3;
use landscape_grass::core::{logging, Error, ManualClock, Result, Shared};
use landscape_grass::grass::density::encode_height;
use landscape_grass::grass::{
    DensitySampleGrid, ExclusionRegistry, GrassConfig, GrassLandscape, GrassScheduler,
    GrassTile, GrassType, GrassVariety, HeadlessSink, MeshId,
};
use landscape_grass::math::Aabb;

const TILE_QUADS: u32 = 63;
const TILE_SPACING: f32 = 2.0;
const HEIGHT_AMPLITUDE: f32 = 24.0;
const SEED: u32 = 12345;

struct Args {
    tiles: u32,
    frames: u32,
    config: Option<String>,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let value = |flag: &str| args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1));
    let number = |flag: &str, default: u32| -> Result<u32> {
        match value(flag) {
            Some(v) => v.parse().map_err(|_| Error::Config(format!("{} expects a number, got '{}'", flag, v))),
            None => Ok(default),
        }
    };
    Ok(Args {
        tiles: number("--tiles", 4)?.max(1),
        frames: number("--frames", 600)?,
        config: value("--config").cloned(),
    })
}

fn grass_types() -> Vec<Shared<GrassType>> {
    let meadow = GrassType::new("meadow").with_variety(GrassVariety {
        mesh: Some(MeshId(1)),
        density: 150.0,
        start_cull_distance: 40.0,
        end_cull_distance: 60.0,
        ..Default::default()
    });
    let flowers = GrassType::new("wildflowers")
        .with_variety(GrassVariety {
            mesh: Some(MeshId(2)),
            density: 20.0,
            use_grid: false,
            start_cull_distance: 70.0,
            end_cull_distance: 90.0,
            align_to_surface: false,
            ..Default::default()
        })
        .with_density_scaling(true);
    vec![Shared::new(meadow), Shared::new(flowers)]
}

/// Generate tiles with heights and one weight layer per grass type. The
/// grids come back unpublished, as if loaded from disk.
fn build_landscape(tiles_per_axis: u32, grass_types: Vec<Shared<GrassType>>) -> (GrassLandscape, Vec<DensitySampleGrid>) {
    let heights = Fbm::<Perlin>::new(SEED).set_octaves(5).set_persistence(0.5);
    let layers: Vec<Perlin> = (0..grass_types.len() as u32).map(|i| Perlin::new(SEED + 1 + i)).collect();
    let tile_size = TILE_QUADS as f32 * TILE_SPACING;

    let coords: Vec<(u32, u32)> = (0..tiles_per_axis)
        .flat_map(|x| (0..tiles_per_axis).map(move |z| (x, z)))
        .collect();

    let (tiles, grids): (Vec<Shared<GrassTile>>, Vec<DensitySampleGrid>) = coords
        .par_iter()
        .map(|&(tx, tz)| {
            let origin = Vec3::new(tx as f32 * tile_size, 0.0, tz as f32 * tile_size);
            let tile = GrassTile::new(
                format!("tile_{}_{}", tx, tz),
                origin,
                Vec3::new(TILE_SPACING, 1.0, TILE_SPACING),
                TILE_QUADS,
            );
            let stride = tile.stride();

            let mut raw_heights = Vec::with_capacity(stride * stride);
            let (mut min_y, mut max_y) = (f32::MAX, f32::MIN);
            for z in 0..stride {
                for x in 0..stride {
                    let wx = (origin.x + x as f32 * TILE_SPACING) as f64 / 200.0;
                    let wz = (origin.z + z as f32 * TILE_SPACING) as f64 / 200.0;
                    let h = heights.get([wx, wz]) as f32 * HEIGHT_AMPLITUDE;
                    min_y = min_y.min(h);
                    max_y = max_y.max(h);
                    raw_heights.push(encode_height(h));
                }
            }

            let mut grid = DensitySampleGrid::new(stride, raw_heights, tile.material_state());
            for (grass, layer) in grass_types.iter().zip(&layers) {
                let weights = (0..stride * stride)
                    .map(|i| {
                        let wx = (origin.x + (i % stride) as f32 * TILE_SPACING) as f64 / 60.0;
                        let wz = (origin.z + (i / stride) as f32 * TILE_SPACING) as f64 / 60.0;
                        let n = (layer.get([wx, wz]) + 1.0) * 0.5;
                        (n.clamp(0.0, 1.0) * 255.0) as u8
                    })
                    .collect();
                grid.set_weights(grass.id(), weights);
            }

            (Shared::new(tile.with_height_range(min_y, max_y)), grid)
        })
        .unzip();

    (GrassLandscape { tiles, grass_types }, grids)
}

fn main() -> Result<()> {
    logging::init();
    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => GrassConfig::load(path)?,
        None => GrassConfig::default(),
    };

    println!("=== Grass simulation: {0}x{0} tiles, {1} frames ===", args.tiles, args.frames);
    let start = Instant::now();
    let (landscape, grids) = build_landscape(args.tiles, grass_types());
    println!("Landscape generated in {:.2}s", start.elapsed().as_secs_f64());

    let clock = Arc::new(ManualClock::new());
    let exclusions = Arc::new(ExclusionRegistry::new());
    let mut scheduler = GrassScheduler::new(config, Arc::clone(&exclusions), HeadlessSink::new())?
        .with_clock(clock.clone());
    for (tile, grid) in landscape.tiles.iter().zip(grids) {
        scheduler.publish_density(tile, grid, &landscape.grass_types);
    }

    let world_size = args.tiles as f32 * TILE_QUADS as f32 * TILE_SPACING;
    let frame_time = Duration::from_secs_f64(1.0 / 60.0);
    let mut building: Option<Shared<()>> = None;

    let sim_start = Instant::now();
    for frame in 0..args.frames {
        let t = frame as f32 / args.frames.max(1) as f32;
        let camera = Vec3::new(t * world_size, 2.0, world_size * 0.5);

        // a building appears ahead of the camera for the middle stretch of the flight
        if frame == args.frames / 4 {
            let owner = Shared::new(());
            let center = camera + Vec3::new(40.0, 0.0, 0.0);
            exclusions.add(owner.owner_handle(), Aabb::from_center_half_extent(center, Vec3::new(15.0, 50.0, 15.0)));
            building = Some(owner);
        } else if frame == args.frames / 2 {
            exclusions.dump();
            // dropping the owner is enough, the scheduler purges stale boxes
            building = None;
        }

        let stats = scheduler.tick(&landscape, &[camera], false);
        if frame % 60 == 0 {
            log::info!(
                "frame {}: {} records, {} pending, {} batches, {} instances",
                frame, stats.records, stats.pending_tasks, stats.owned_batches,
                scheduler.sink().total_instances()
            );
        }
        clock.advance(frame_time);
    }
    drop(building);

    let end_camera = Vec3::new(world_size, 2.0, world_size * 0.5);
    let stats = scheduler.tick(&landscape, &[end_camera], true);
    log::info!("Final forced tick: {:?}", stats);

    let sink = scheduler.sink();
    println!(
        "Done in {:.2}s: {} batches created, {} destroyed, {} live, {} instances",
        sim_start.elapsed().as_secs_f64(),
        sink.created_count(),
        sink.destroyed().len(),
        sink.live_count(),
        sink.total_instances()
    );

    scheduler.flush(&landscape, None, true);
    println!("Flushed: {} live batches remain", scheduler.sink().live_count());
    Ok(())
}
