use clap::Subcommand;
use kiln_image::ImageRepository;
use kiln_instance::Paths;
use std::path::PathBuf;

use crate::utils::format_size;

#[derive(Subcommand)]
pub enum ImageCommands {
    /// Create a new empty base image
    Create {
        /// Image name
        name: String,

        /// Disk size (e.g. 10G)
        size: String,
    },
    /// Fork an image as a copy-on-write child
    Fork {
        /// Existing image to fork from
        base: String,

        /// Name of the new image
        new: String,
    },
    /// Import an image from a gzipped tar archive
    Import {
        /// Image name
        name: String,

        /// Archive file (defaults to stdin)
        file: Option<PathBuf>,
    },
    /// Export an image as a gzipped tar archive
    Export {
        /// Image name
        name: String,

        /// Archive file (defaults to stdout)
        file: Option<PathBuf>,
    },
    /// Remove an image
    #[command(name = "remove", visible_alias = "rm")]
    Remove {
        /// Image name
        name: String,
    },
    /// List images
    List,
    /// Download and prepare a base cloud image for this host
    Prepare {
        /// Platform to prepare (default: this host's platform)
        #[arg(long)]
        platform: Option<String>,
    },
}

pub async fn handle_image_command(
    paths: &Paths,
    cmd: ImageCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let repo = ImageRepository::new(&paths.images);
    std::fs::create_dir_all(repo.root())?;

    match cmd {
        ImageCommands::Create { name, size } => {
            repo.create(&name, &size).await?;
            println!("Created image: {}", name);
        }
        ImageCommands::Fork { base, new } => {
            repo.fork(&base, &new).await?;
            println!("Forked {} from {}", new, base);
        }
        ImageCommands::Import { name, file } => {
            match file {
                Some(path) => repo.import(&name, std::fs::File::open(path)?)?,
                None => repo.import(&name, std::io::stdin().lock())?,
            }
            println!("Imported image: {}", name);
        }
        ImageCommands::Export { name, file } => match file {
            Some(path) => {
                repo.export(&name, std::fs::File::create(path)?)?;
                println!("Exported image: {}", name);
            }
            None => repo.export(&name, std::io::stdout().lock())?,
        },
        ImageCommands::Remove { name } => {
            repo.remove(&name).await?;
            println!("Removed image: {}", name);
        }
        ImageCommands::List => {
            let images = repo.list().await?;
            if images.is_empty() {
                println!("No images found");
                return Ok(());
            }

            println!("{:<30} {:<10}", "NAME", "DISK");
            for image in images {
                println!("{:<30} {:<10}", image.name, format_size(image.disk_size));
            }
        }
        ImageCommands::Prepare { platform } => {
            let name = kiln_image::prepare(&repo, platform.as_deref(), &paths.cache).await?;
            println!("Prepared image: {}", name);
        }
    }

    Ok(())
}
