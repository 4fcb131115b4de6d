use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lcm_diffusion::{
    AppConfig, Generators, Images, LatentConsistencyModelPipeline, LcmInputs, OutputType,
    PipelineConfig, PretrainedOptions,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "lcm")]
#[command(about = "Latent Consistency Model text-to-image generation", long_about = None)]
struct Cli {
    /// Runtime settings file (defaults to ./lcm.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate images from a prompt
    Generate {
        /// Text prompt
        prompt: String,

        /// Hub repository or local pipeline directory
        #[arg(short, long, env = "LCM_MODEL_ID")]
        model: Option<String>,

        /// Denoising steps
        #[arg(short = 'n', long)]
        steps: Option<usize>,

        /// Guidance scale
        #[arg(short, long)]
        guidance: Option<f64>,

        /// Random seed
        #[arg(short, long)]
        seed: Option<u64>,

        /// Image height in pixels
        #[arg(long)]
        height: Option<usize>,

        /// Image width in pixels
        #[arg(long)]
        width: Option<usize>,

        /// Images to generate
        #[arg(long, default_value_t = 1)]
        num_images: usize,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a pipeline configuration file
    Config {
        /// Pipeline configuration (JSON)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show build and device information
    Info,
}

fn init_logging(verbosity: u8, json: bool) {
    let default_level = match verbosity {
        0 => "lcm_diffusion=info,lcm=info,warn",
        1 => "lcm_diffusion=debug,lcm=debug,info",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(json_layer).init();
    } else {
        let fmt_layer = fmt::layer().with_target(false).with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut app = AppConfig::load(cli.config.as_deref()).context("Failed to load settings")?;
    init_logging(cli.verbose, app.json_logs);

    match cli.command {
        Commands::Generate {
            prompt,
            model,
            steps,
            guidance,
            seed,
            height,
            width,
            num_images,
            output,
        } => {
            if let Some(model) = model {
                app.model_id = model;
            }
            if let Some(steps) = steps {
                app.num_inference_steps = steps;
            }
            if let Some(guidance) = guidance {
                app.guidance_scale = guidance;
            }
            if let Some(seed) = seed {
                app.seed = seed;
            }
            if let Some(output) = output {
                app.output_dir = output;
            }
            app.validate().context("Invalid settings")?;
            generate(&app, prompt, height, width, num_images).await?;
        }

        Commands::Config { file } => {
            validate_config(&file)?;
        }

        Commands::Info => {
            show_system_info(&app);
        }
    }

    Ok(())
}

async fn generate(
    app: &AppConfig,
    prompt: String,
    height: Option<usize>,
    width: Option<usize>,
    num_images: usize,
) -> Result<()> {
    info!("Loading pipeline {}", app.model_id);
    let options = PretrainedOptions::from_app_config(app).context("Failed to open device")?;
    let mut pipe = LatentConsistencyModelPipeline::from_pretrained(&app.model_id, options)
        .await
        .context("Failed to load pipeline")?;

    let started = std::time::Instant::now();
    let output = pipe
        .call(LcmInputs {
            height,
            width,
            num_inference_steps: app.num_inference_steps,
            guidance_scale: app.guidance_scale,
            num_images_per_prompt: num_images,
            generators: Generators::seeded(app.seed),
            output_type: OutputType::Pil,
            ..LcmInputs::prompt(prompt)
        })
        .context("Generation failed")?;
    info!("Generated in {:.2?}", started.elapsed());

    let Images::Pil(images) = output.images else {
        anyhow::bail!("pipeline did not return RGB images");
    };
    fs::create_dir_all(&app.output_dir).context("Failed to create output directory")?;
    for (i, image) in images.iter().enumerate() {
        let path = app.output_dir.join(format!("lcm_{}_{i}.png", app.seed));
        image
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved {}", path.display());
    }

    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", path.display());

    let config = PipelineConfig::from_file(path).context("Failed to load configuration file")?;

    info!("Configuration is valid");
    info!("  - UNet: {:?} channels, time_cond_proj_dim {:?}", config.unet.block_out_channels, config.unet.time_cond_proj_dim);
    info!("  - VAE: {:?} channels, scale factor {}", config.vae.block_out_channels, config.vae.scale_factor());
    info!("  - Text encoder: {} layers of width {}", config.text_encoder.num_hidden_layers, config.text_encoder.hidden_size);
    info!("  - Scheduler: {} original steps, {:?} prediction", config.scheduler.original_inference_steps, config.scheduler.prediction_type);
    info!("  - Default image size: {}px", config.default_image_size());
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}

fn show_system_info(app: &AppConfig) {
    println!("lcm - Latent Consistency Model text-to-image");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Default model: {}", app.model_id);
    println!("Device: {:?} (ordinal {}), precision {:?}", app.device, app.device_ordinal, app.precision);
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  ✅ NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  ❌ CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  ✅ Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  ❌ Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  ✅ Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  ❌ Accelerate support (not compiled)");

    println!("  ✅ CPU inference");
    println!();
    println!("Usage:");
    println!("  lcm generate \"a photograph of an astronaut riding a horse\" -n 4");
    println!("  lcm config -f pipeline.json   # Validate a pipeline configuration");
    println!("  lcm info                      # Show this information");
}
