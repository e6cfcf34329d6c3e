//! Helios playout demo: synthetic frames scheduled into a software output
//! device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use color_eyre::Result;
use flume::bounded;
use tracing::{error, info, warn};

use helios::frame::{Picture, PictureData, PictureFormat, PictureMeta, SideData};
use helios::output::{OutputScheduler, SimulatedOutput};
use helios::pack;
use helios::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("helios=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Helios launching...");

    let cfg = load_config();
    helios::CONFIG.store(Arc::new(cfg.clone()));

    let device = SimulatedOutput::new();
    let mut scheduler = OutputScheduler::new(device);
    scheduler.configure(
        cfg.video.clone(),
        cfg.audio.clone(),
        cfg.pipeline.preroll_seconds,
    )?;

    // Set up tx/rx
    let (tx, rx) = bounded::<Picture>(cfg.pipeline.channel_capacity);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    // Producer: synthetic frames with periodic caption and AFD metadata
    let video = cfg.video.clone();
    let frame_count = cfg.pipeline.frame_count;
    let producer = tokio::task::spawn_blocking(move || {
        for pts in 0..frame_count as i64 {
            let pic = synthesize(pts, video.width, video.height);
            if tx.send(pic).is_err() {
                break;
            }
        }
    });

    // Playout: pack and submit in timestamp order; backpressure comes from
    // the scheduler's slot gate
    let shutdown_play = Arc::clone(&shutdown);
    let playout = tokio::task::spawn_blocking(move || -> Result<()> {
        for pic in rx.iter() {
            if shutdown_play.load(Ordering::SeqCst) {
                break;
            }
            let unit = pack::pack_picture(&pic)?;
            if let Err(e) = scheduler.submit_packed(unit) {
                // Device rejections drop the frame and keep going
                error!("dropping frame: {e}");
            }
        }
        scheduler.stop()?;
        Ok(())
    });

    producer.await?;
    playout.await??;

    info!("Helios shutting down");
    Ok(())
}

/// Layered configuration: defaults, then an optional `helios.toml`, then
/// `HELIOS_*` environment overrides.
fn load_config() -> Config {
    let loaded = config::Config::builder()
        .add_source(config::Config::try_from(&Config::default()).unwrap_or_default())
        .add_source(config::File::with_name("helios").required(false))
        .add_source(config::Environment::with_prefix("HELIOS").separator("__"))
        .build()
        .and_then(|c| c.try_deserialize::<Config>());
    match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("using default configuration: {e}");
            Config::default()
        }
    }
}

/// Moving luma gradient in 10-bit 4:2:2, captions every 5th frame and a
/// format description once a second.
fn synthesize(pts: i64, width: u32, height: u32) -> Picture {
    let (w, h) = (width as usize, height as usize);
    let mut y = vec![0u16; w * h];
    for (i, s) in y.iter_mut().enumerate() {
        *s = (((i + pts as usize * 7) % 876) + 64) as u16;
    }
    let u = vec![512u16; w / 2 * h];
    let v = vec![512u16; w / 2 * h];

    let mut side_data = Vec::new();
    if pts % 5 == 0 {
        side_data.push(SideData::Captions(Bytes::from_static(&[0x44, 0x31, 0x32])));
    }
    if pts % 25 == 0 {
        side_data.push(SideData::FormatDescription(Bytes::from_static(&[0x0A])));
    }

    Picture {
        meta: PictureMeta {
            width,
            height,
            format: PictureFormat::Yuv422p10,
            interlaced: false,
            pts,
        },
        data: PictureData::Planes10(vec![Arc::from(y), Arc::from(u), Arc::from(v)]),
        side_data,
    }
}
