//! Lumen compute manager command line
//!
//! ## Usage
//!
//! ```bash
//! # List devices of every class
//! lumen devices
//!
//! # Select the first general-purpose device and report optional features
//! lumen --class general-purpose probe
//!
//! # Build every configured program, writing cached binaries
//! lumen --config lumen.json build --recompile
//!
//! # Print the default configuration
//! lumen config > lumen.json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lumen_compute::{ComputeBackend, ComputeManager, DeviceClass, HostBackend, ManagerConfig};
use lumen_profiler::lock;

#[derive(Parser, Debug)]
#[command(name = "lumen")]
#[command(version)]
#[command(about = "Compute device manager", long_about = None)]
struct Args {
    /// Device backend
    #[arg(long, value_enum, default_value = "host")]
    backend: BackendKind,

    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device class, overriding the configuration
    #[arg(long, value_enum)]
    class: Option<ClassArg>,

    /// Device index within the class, overriding the configuration
    #[arg(long)]
    index: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendKind {
    /// Software devices on the host CPU
    Host,
    /// NVIDIA devices through the CUDA driver (needs the `cuda` feature)
    Cuda,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ClassArg {
    GeneralPurpose,
    Accelerator,
}

impl From<ClassArg> for DeviceClass {
    fn from(class: ClassArg) -> Self {
        match class {
            ClassArg::GeneralPurpose => DeviceClass::GeneralPurpose,
            ClassArg::Accelerator => DeviceClass::Accelerator,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate devices, of every class unless `--class` is given
    Devices,
    /// Select a device and run the capability probe
    Probe,
    /// Build configured programs and report kernel launch shapes
    Build {
        /// Ignore cached binaries
        #[arg(long)]
        recompile: bool,
        /// Also build the fill fallback kernel
        #[arg(long)]
        fill: bool,
    },
    /// Print the effective configuration as JSON
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let mut config = match &args.config {
        Some(path) => ManagerConfig::from_json_file(path)?,
        None => ManagerConfig::default(),
    };
    if let Some(class) = args.class {
        config.device.class = class.into();
    }
    if let Some(index) = args.index {
        config.device.index = index;
    }
    let filter = args.class.map(DeviceClass::from);

    match args.backend {
        BackendKind::Host => run(HostBackend::new(), config, args.command, filter),
        #[cfg(feature = "cuda")]
        BackendKind::Cuda => run(lumen_compute::CudaBackend::new(), config, args.command, filter),
        #[cfg(not(feature = "cuda"))]
        BackendKind::Cuda => Err("lumen was built without the `cuda` feature".into()),
    }
}

fn run(
    backend: impl ComputeBackend + 'static,
    mut config: ManagerConfig,
    command: Command,
    filter: Option<DeviceClass>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Command::Build { recompile: true, .. } = command {
        config.cache.build.recompile = true;
    }

    let mut manager = ComputeManager::new(backend, config)?;
    info!("Backend: {}", manager.backend().name());

    match command {
        Command::Devices => {
            manager.scan()?;
            let classes = match filter {
                Some(class) => vec![class],
                None => vec![DeviceClass::GeneralPurpose, DeviceClass::Accelerator],
            };
            let devices: Vec<_> = classes
                .into_iter()
                .flat_map(|class| manager.list_devices(class).to_vec())
                .collect();
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        Command::Probe => {
            let device = manager.initialize()?.name().to_string();
            let capabilities = manager.capabilities().unwrap_or_default();
            info!("Probed '{}'", device);
            println!("{}", serde_json::to_string_pretty(&capabilities)?);
        }
        Command::Build { fill, .. } => {
            manager.initialize()?;
            if fill {
                manager.register_fill_kernel()?;
            }
            {
                let mut profiler = lock(manager.profiler());
                profiler.configure("kernel_ALL", "All kernel launches", 1, 0);
            }

            let created = manager.load_kernels()?;
            manager.log_kernel_tree();
            manager.log_kernel_info();
            println!("{}", serde_json::to_string_pretty(&manager.kernel_info())?);
            info!("Built {} kernel(s)", created);
            manager.print_profile(true);
        }
        Command::Config => println!("{}", manager.config().to_json_string()?),
    }

    Ok(())
}
