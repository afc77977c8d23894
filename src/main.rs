//! mapsync demo binary
//!
//! Loads a map data fixture into an in-memory store through the controller,
//! waits for persistence, reads the area back and prints cache statistics.
//!
//! ```text
//! ┌──────────┐    ┌──────────────────┐    ┌────────────────┐
//! │ Fixture  │───▶│ MapDataController│───▶│ InMemoryStore  │
//! │ (JSON)   │    │  + SpatialCache  │    │ (background)   │
//! └──────────┘    └──────────────────┘    └────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mapsync::adapters::{
    FlagPersistenceSignal, InMemoryCreatedElementsTracker, InMemoryMapStore, LoggingListener,
    SimpleGeometryCreator,
};
use mapsync::cache::{CacheConfig, DEFAULT_MAX_TILES, DEFAULT_TILE_ZOOM};
use mapsync::domain::{Entity, LatLon, Node, StoragePorts, Tags, Way};
use mapsync::error::{Error, Result};
use mapsync::{BoundingBox, ControllerConfig, MapData, MapDataController};

// =============================================================================
// CLI Arguments
// =============================================================================

/// mapsync - tile-indexed map data cache demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON map data fixture; a small generated grid when omitted
    #[arg(long, env = "MAPSYNC_FIXTURE")]
    fixture: Option<PathBuf>,

    /// Area to load as min_lat,min_lon,max_lat,max_lon
    #[arg(long, env = "MAPSYNC_BBOX", default_value = "52.5,13.4,52.51,13.41")]
    bbox: String,

    /// Tiles kept after a trim
    #[arg(long, env = "MAPSYNC_MAX_TILES", default_value_t = DEFAULT_MAX_TILES)]
    max_tiles: usize,

    /// Zoom level of the cache tiles
    #[arg(long, env = "MAPSYNC_TILE_ZOOM", default_value_t = DEFAULT_TILE_ZOOM)]
    tile_zoom: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let bbox = parse_bbox(&args.bbox)?;
    info!("Starting mapsync");
    info!("  Bounding box: {}", bbox);
    info!("  Tile zoom: {}", args.tile_zoom);
    info!("  Max tiles: {}", args.max_tiles);

    let data = match &args.fixture {
        Some(path) => load_fixture(path)?,
        None => demo_grid(&bbox),
    };
    info!("Loaded {} entities", data.len());

    let config = ControllerConfig {
        cache: CacheConfig {
            tile_zoom: args.tile_zoom,
            max_tiles: args.max_tiles,
        },
    };
    let store = Arc::new(InMemoryMapStore::new());
    let controller = MapDataController::new(
        config,
        StoragePorts::from_store(store.clone()),
        Arc::new(SimpleGeometryCreator::new()),
        Arc::new(InMemoryCreatedElementsTracker::new()),
        Some(Arc::new(FlagPersistenceSignal::new())),
    )?;
    controller.add_listener(Arc::new(LoggingListener::info_level()));

    controller.replace_for_bbox(&bbox, data)?;
    controller.flush().await;

    let read = controller.get_map_data_in_bbox(&bbox)?;
    info!(
        entities = read.data.len(),
        geometries = read.geometries.len(),
        "Read back bounding box"
    );

    let stats = controller.cache_stats();
    info!(
        failed_writes = controller.failed_writes(),
        stored = ?store.stats(),
        "Persistence finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

fn parse_bbox(value: &str) -> Result<BoundingBox> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::InvalidBoundingBox {
            reason: format!("{}: {}", value, e),
        })?;
    match parts.as_slice() {
        [min_lat, min_lon, max_lat, max_lon] => {
            BoundingBox::try_new(*min_lat, *min_lon, *max_lat, *max_lon)
        }
        _ => Err(Error::InvalidBoundingBox {
            reason: format!("expected 4 comma-separated values, got {}", parts.len()),
        }),
    }
}

fn load_fixture(path: &PathBuf) -> Result<MapData> {
    let file = std::fs::File::open(path)?;
    let data = serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(data)
}

/// A 5x5 node grid inside `bbox` with one way per row.
fn demo_grid(bbox: &BoundingBox) -> MapData {
    const SIZE: i64 = 5;
    let step_lat = (bbox.max.lat - bbox.min.lat) / (SIZE + 1) as f64;
    let step_lon = (bbox.max.lon - bbox.min.lon) / (SIZE + 1) as f64;

    let mut data = MapData::with_bbox(*bbox);
    for row in 0..SIZE {
        let mut node_ids = Vec::new();
        for col in 0..SIZE {
            let id = row * SIZE + col + 1;
            node_ids.push(id);
            data.insert(Entity::Node(Node {
                id,
                version: 1,
                tags: Tags::new(),
                position: LatLon::new(
                    bbox.min.lat + step_lat * (row + 1) as f64,
                    bbox.min.lon + step_lon * (col + 1) as f64,
                ),
                timestamp_edited: 0,
            }));
        }
        let mut tags = Tags::new();
        tags.insert("highway".into(), "residential".into());
        data.insert(Entity::Way(Way {
            id: 1000 + row,
            version: 1,
            tags,
            node_ids,
            timestamp_edited: 0,
        }));
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_bbox() {
        let bbox = parse_bbox("1.0, 2.0, 3.0, 4.0").unwrap();
        assert_eq!(bbox, BoundingBox::new(1.0, 2.0, 3.0, 4.0));

        assert_matches!(parse_bbox("1,2,3"), Err(Error::InvalidBoundingBox { .. }));
        assert_matches!(parse_bbox("a,b,c,d"), Err(Error::InvalidBoundingBox { .. }));
    }

    #[test]
    fn test_demo_grid() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let data = demo_grid(&bbox);
        assert_eq!(data.nodes().count(), 25);
        assert_eq!(data.ways().count(), 5);
        assert!(data.nodes().all(|n| bbox.contains(&n.position)));
    }
}
