//! bale CLI - content-addressed image archive tool

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use bale::{
    export_images, unmount, Container, ExportMode, ExportOptions, ImageSelector, Mount,
    MountFlags, MountOptions, UnmountFlags,
};

#[derive(Parser)]
#[command(name = "bale")]
#[command(about = "content-addressed binary-image archive")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new empty container
    Create {
        /// path to create the container at
        path: PathBuf,
    },

    /// list the images in a container
    Images {
        /// container path
        container: PathBuf,
    },

    /// append a new empty image
    NewImage {
        /// container path
        container: PathBuf,

        /// image name
        name: String,

        /// image description
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// export images from one container into another
    Export {
        /// source container
        src: PathBuf,

        /// destination container
        dst: PathBuf,

        /// source image name (all images if omitted)
        #[arg(short, long)]
        image: Option<String>,

        /// destination image name
        #[arg(short, long)]
        name: Option<String>,

        /// destination image description
        #[arg(short, long)]
        description: Option<String>,

        /// mark the exported image as the boot image
        #[arg(long)]
        boot: bool,

        /// transfer content instead of copying it (consumes the source)
        #[arg(long = "move")]
        move_mode: bool,
    },

    /// mount an image and serve it until unmounted
    Mount {
        /// container path
        container: PathBuf,

        /// image name
        image: String,

        /// mountpoint directory
        mountpoint: PathBuf,

        /// mount read-write
        #[arg(long)]
        rw: bool,

        /// parent directory for the staging area
        #[arg(long)]
        staging_dir: Option<PathBuf>,
    },

    /// request an unmount from the daemon serving a mountpoint
    Unmount {
        /// mountpoint directory
        mountpoint: PathBuf,

        /// commit staged changes (discarded otherwise)
        #[arg(long)]
        commit: bool,

        /// verify object digests during the rewrite
        #[arg(long)]
        check_integrity: bool,

        /// rewrite the container from scratch
        #[arg(long)]
        rebuild: bool,

        /// re-encode stored objects
        #[arg(long)]
        recompress: bool,
    },

    /// verify the integrity of every referenced object
    Verify {
        /// container path
        container: PathBuf,
    },
}

fn main() -> ExitCode {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> bale::Result<ExitCode> {
    match command {
        Commands::Create { path } => {
            Container::create(&path)?;
            println!("created container at {}", path.display());
        }

        Commands::Images { container } => {
            let container = Container::open(&container)?;
            if container.images().is_empty() {
                println!("no images");
            }
            for (i, image) in container.images().iter().enumerate() {
                let boot = if container.boot_index() as usize == i + 1 {
                    " (boot)"
                } else {
                    ""
                };
                let name = if image.name.is_empty() {
                    "<unnamed>"
                } else {
                    &image.name
                };
                println!("{}: {}{}", i + 1, name, boot);
                if !image.description.is_empty() {
                    println!("   {}", image.description);
                }
            }
        }

        Commands::NewImage {
            container,
            name,
            description,
        } => {
            let mut container = Container::open(&container)?;
            container.add_image(&name, &description)?;
            container.save()?;
            println!("added image \"{}\"", name);
        }

        Commands::Export {
            src,
            dst,
            image,
            name,
            description,
            boot,
            move_mode,
        } => {
            let mut src = Container::open(&src)?;
            let mut dst = Container::open(&dst)?;
            let selector = match image {
                Some(name) => ImageSelector::Name(name),
                None => ImageSelector::All,
            };
            let opts = ExportOptions {
                name,
                description,
                boot,
                mode: if move_mode {
                    ExportMode::Move
                } else {
                    ExportMode::Copy
                },
                ..Default::default()
            };
            export_images(&mut src, &selector, &mut dst, &opts)?;
            dst.save()?;
            if !move_mode {
                src.save()?;
            }
            println!("export complete");
        }

        Commands::Mount {
            container,
            image,
            mountpoint,
            rw,
            staging_dir,
        } => {
            let container = Container::open(&container)?;
            let flags = MountFlags { read_write: rw };
            let options = MountOptions {
                staging_parent: staging_dir,
                external: true,
                ..Default::default()
            };
            let mount = Mount::start(
                container,
                &ImageSelector::Name(image),
                &mountpoint,
                flags,
                options,
            )?;
            println!("mounted on {}, waiting for unmount", mountpoint.display());
            mount.join()?;
            println!("unmounted");
        }

        Commands::Unmount {
            mountpoint,
            commit,
            check_integrity,
            rebuild,
            recompress,
        } => {
            let flags = UnmountFlags {
                commit,
                check_integrity,
                rebuild,
                recompress,
            };
            let status = unmount(&mountpoint, flags)?;
            if status != 0 {
                eprintln!("daemon reported status {}", status);
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Verify { container } => {
            let container = Container::open(&container)?;
            let report = container.verify()?;
            for digest in &report.missing {
                println!("missing: {}", digest);
            }
            for digest in &report.corrupt {
                println!("corrupt: {}", digest);
            }
            if !report.is_clean() {
                return Ok(ExitCode::FAILURE);
            }
            println!("ok");
        }
    }
    Ok(ExitCode::SUCCESS)
}
