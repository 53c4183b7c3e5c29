use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Local, Utc};
use clap::Parser;
use rust_decimal_macros::dec;
use tokio::sync::broadcast::error::RecvError;

use render_fleet::cloud::memory::MemoryCloud;
use render_fleet::cloud::{MachineImage, ObjectStore, SpotPrice, StoreLocation};
use render_fleet::config::FleetConfig;
use render_fleet::fleet::{FleetEvent, summarize};
use render_fleet::format;
use render_fleet::job::{Confirmation, JobArgs, JobOutcome, JobReport, JobSettings, RenderJob, after_failure};
use render_fleet::local::{LocalFleet, RendererFactory, SimulatedRender, SimulatedScene};
use render_fleet::render::{Blender, BlenderRender, FrameRenderer, SceneInspector};

#[derive(Parser, Debug)]
#[command(name = "render-fleet")]
#[command(version)]
#[command(about = "Render a Blender scene across a fleet of spot instances")]
struct Cli {
    #[command(flatten)]
    job: JobArgs,

    /// Estimate the spot cost once the fleet has terminated
    #[arg(long)]
    estimate_cost: bool,

    /// Simulate Blender instead of running it
    #[arg(long)]
    simulate_render: bool,

    /// Delete every render-job resource if the job fails
    #[arg(long)]
    clean_up_on_failure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = FleetConfig::from_env().context("reading RENDER_FLEET_* configuration")?;

    eprintln!("🎬 Render Fleet v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Scene: {}", cli.job.blend_file.display());
    eprintln!("   Instance type: {}", config.instance_type);
    eprintln!("   Cloud: local simulation\n");

    let (inspector, renderers): (Arc<dyn SceneInspector>, RendererFactory) = if cli.simulate_render {
        (
            Arc::new(SimulatedScene::default()),
            SimulatedRender::factory(500..=1500),
        )
    } else {
        let home = cli.job.blender_home.clone().unwrap_or(config.blender_home.clone());
        let blender = Blender::new(home);
        let for_workers = blender.clone();
        (
            Arc::new(blender),
            Arc::new(move |scene: &Path, bootstrap: &render_fleet::job::WorkerBootstrap| {
                Arc::new(BlenderRender::new(
                    for_workers.clone(),
                    scene,
                    bootstrap.samples,
                    bootstrap.motion_blur,
                )) as Arc<dyn FrameRenderer>
            }),
        )
    };

    let attrs = inspector
        .scene_attributes(&cli.job.blend_file)
        .await
        .with_context(|| format!("reading scene attributes of {}", cli.job.blend_file.display()))?;
    let settings = JobSettings::build(&cli.job, config, &attrs, std::io::stdin().is_terminal())?;

    let cloud = MemoryCloud::new();
    seed_local_cloud(&cloud, &settings).await?;

    let work_dir = std::env::temp_dir().join(format!("render-fleet-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&work_dir)
        .await
        .with_context(|| format!("creating {}", work_dir.display()))?;

    let fleet = Arc::new(
        LocalFleet::new(cloud.clone(), work_dir.join("instances"), renderers)
            .with_max_tier(settings.config.max_tier),
    );
    let backends = fleet.backends();
    settings.verify_blender_archive(backends.objects.as_ref()).await?;

    let job = RenderJob::new(backends.clone(), settings, inspector)
        .with_work_dir(&work_dir)
        .with_cost_estimate(cli.estimate_cost);

    let mut events = job.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Progress output fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = job.run(prompt).await;
    fleet.shutdown().await;
    let _ = printer.await;
    let _ = tokio::fs::remove_dir_all(&work_dir).await;

    match result {
        Ok(JobOutcome::Completed(report)) => {
            print_report(&report);
            Ok(())
        }
        Ok(JobOutcome::Cancelled { cleaned_up }) => {
            println!(
                "Job cancelled{}",
                if cleaned_up { ", resources deleted" } else { "" }
            );
            Ok(())
        }
        Err(e) => {
            if let Some(swept) = after_failure(&backends, &e, cli.clean_up_on_failure).await {
                eprintln!(
                    "Deleted {} log groups, {} buckets and {} tables left by the failed job",
                    swept.log_groups.len(),
                    swept.buckets.len(),
                    swept.tables.len()
                );
            }
            Err(e).context("render job failed")
        }
    }
}

/// Stand in for what a real account already has: a worker image, the
/// Blender archive in the file store and a spot price.
async fn seed_local_cloud(cloud: &MemoryCloud, settings: &JobSettings) -> anyhow::Result<()> {
    let config = &settings.config;
    cloud
        .compute
        .add_image(MachineImage {
            id: "ami-local".to_string(),
            name: config.image_pattern.replace('*', "local"),
            description: "Local simulation image".to_string(),
            created: Utc::now() - Duration::days(7),
        })
        .await;
    cloud
        .compute
        .add_spot_price(
            &config.instance_type,
            SpotPrice {
                timestamp: Utc::now() - Duration::hours(1),
                price: dec!(0.526),
                availability_zone: "local-1a".to_string(),
            },
        )
        .await;

    if let StoreLocation::Object { container, key } = settings.blender_archive()? {
        cloud.objects.create_container(&container).await?;
        cloud.objects.put(&container, &key, Vec::new()).await?;
    }
    Ok(())
}

fn ask(question: &str) -> Option<String> {
    print!("{question}");
    std::io::stdout().flush().ok()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer).ok()?;
    Some(answer.trim().to_string())
}

fn prompt(_settings: &JobSettings) -> Confirmation {
    tokio::task::block_in_place(|| {
        if ask("Launch workers? [y/n] ").as_deref() == Some("y") {
            Confirmation::Launch
        } else {
            Confirmation::Cancel {
                clean_up: ask("Clean up? [Y/n] ").as_deref() != Some("n"),
            }
        }
    })
}

fn print_event(event: &FleetEvent) {
    match event {
        FleetEvent::Log(log) => println!(
            "{} {} {}",
            format::local_timestamp(log.timestamp),
            log.stream_name,
            log.message
        ),
        FleetEvent::StatesChanged { at, counts } => println!(
            "{} Instances: {}",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            summarize(counts)
        ),
        FleetEvent::FramesComplete { terminating } => println!(
            "All frames have been rendered, terminating {} instances that are still running",
            terminating.len()
        ),
        FleetEvent::AllTerminated => println!("All instances have been terminated"),
    }
}

fn print_report(report: &JobReport) {
    println!(
        "Downloaded {} files ({}) to {}",
        report.frames_downloaded,
        format::size(report.bytes_downloaded),
        report.results_dir.display()
    );
    println!("Fleet ran for {}", format::elapsed(report.elapsed));
    if let Some(cost) = &report.cost {
        println!(
            "Estimated cost: ${} ({} instances for {:.2}h at ${}/h)",
            cost.total,
            cost.instance_count,
            cost.hours,
            cost.price_per_hour
        );
    }
    println!("There are {} instances still running", report.non_terminated);
}
