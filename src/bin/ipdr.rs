use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ipdr::cid;
use ipdr::ipfs::{IpfsClient, IpfsConfig};
use ipdr::registry;
use ipdr::server::{default_cid_store_path, Server, ServerConfig};

/// InterPlanetary Docker Registry
#[derive(Debug, Parser)]
#[clap(name = "ipdr", version, about = "Push, pull and serve container images backed by IPFS")]
struct App {
    /// Suppress logs and print machine-readable output only
    #[clap(long, short, global = true)]
    silent: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Push an exported image archive to IPFS in registry layout
    Push {
        /// Path to the image archive produced by the daemon (`-` for stdin)
        archive: PathBuf,
        /// The name[:tag] the image was saved under; selects the manifest tag
        #[clap(long, default_value = "")]
        image: String,
        /// Remote IPFS API host to push the image to
        #[clap(long, default_value = "127.0.0.1:5001")]
        ipfs_host: String,
        /// Read-only IPFS gateway URL
        #[clap(long = "ipfs-gateway", short = 'g', default_value = "127.0.0.1:8080")]
        ipfs_gateway: String,
    },
    /// Print the registry-qualified reference to pull an image by CID or name
    Pull {
        /// CID (either encoding) or repository name
        image: String,
        /// The local registry host the daemon pulls through
        #[clap(long, default_value = "docker.localhost:5000")]
        docker_registry_host: String,
    },
    /// Start the IPFS-backed registry server
    Server {
        /// The port for the registry to listen on
        #[clap(short, long, default_value_t = 5000)]
        port: u16,
        /// Path to the .crt file for TLS
        #[clap(long)]
        tls_cert_path: Option<PathBuf>,
        /// Path to the .key file for TLS
        #[clap(long)]
        tls_key_path: Option<PathBuf>,
        /// Remote IPFS API host
        #[clap(long, default_value = "127.0.0.1:5001")]
        ipfs_host: String,
        /// Read-only IPFS gateway URL
        #[clap(long = "ipfs-gateway", short = 'g', default_value = "127.0.0.1:8080")]
        ipfs_gateway: String,
        /// Resolver backend mapping repo:reference to CID; accepts a dnslink
        /// domain, an /ipfs/ path or a file: path (repeatable, in order)
        #[clap(long = "cid-resolver")]
        cid_resolvers: Vec<String>,
        /// CID local store location
        #[clap(long = "cid-store")]
        cid_store: Option<PathBuf>,
    },
    /// Convert a hash to IPFS format or Docker registry format
    Convert {
        hash: String,
        /// Output format: "docker" or "ipfs"
        #[clap(short, long)]
        format: String,
    },
    /// Look up a CID by image name[:tag] via a running registry server
    Dig {
        name: String,
        /// The registry server to interrogate
        #[clap(long, default_value = "docker.localhost:5000")]
        docker_registry_host: String,
        /// Print the CID in short form rather than the manifest content
        #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
        short: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = App::parse();
    let silent = app.silent;

    let default_level = if silent { "warn" } else { "debug" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match app.cmd {
        Command::Push {
            archive,
            image,
            ipfs_host,
            ipfs_gateway,
        } => {
            let client = IpfsClient::new(&IpfsConfig {
                host: ipfs_host,
                gateway_url: ipfs_gateway,
            })?;

            let hash = if archive == Path::new("-") {
                registry::push_archive(&client, std::io::stdin().lock(), &image).await?
            } else {
                let file = File::open(&archive)
                    .with_context(|| format!("cannot open image archive {}", archive.display()))?;
                registry::push_archive(&client, file, &image).await?
            };

            if silent {
                println!("{hash}");
            } else {
                println!("\nSuccessfully pushed image to IPFS:\n/ipfs/{hash}");
            }
        }

        Command::Pull {
            image,
            docker_registry_host,
        } => {
            let reference = registry::pull_reference(&docker_registry_host, &image);
            if silent {
                println!("{reference}");
            } else {
                println!("\nPull the image with:\ndocker pull {reference}");
            }
        }

        Command::Server {
            port,
            tls_cert_path,
            tls_key_path,
            ipfs_host,
            ipfs_gateway,
            cid_resolvers,
            cid_store,
        } => {
            let cid_store_path = cid_store.unwrap_or_else(default_cid_store_path);
            std::fs::create_dir_all(&cid_store_path).with_context(|| {
                format!("cannot create CID store at {}", cid_store_path.display())
            })?;

            let cid_resolvers = if cid_resolvers.is_empty() {
                vec![
                    format!("file:{}", cid_store_path.display()),
                    "oci.dhnt.io".to_owned(),
                ]
            } else {
                cid_resolvers
            };

            let server = Server::new(ServerConfig {
                ipfs_host,
                ipfs_gateway,
                cid_resolvers,
                cid_store_path,
                port,
                tls_cert_path,
                tls_key_path,
                debug: !silent,
            });
            server.start().await?;
        }

        Command::Convert { hash, format } => match format.as_str() {
            "docker" => println!("{}", cid::dockerize(&hash)),
            "ipfs" => println!("{}", cid::ipfsify(&hash)),
            _ => bail!("convert format must be either \"docker\" or \"ipfs\""),
        },

        Command::Dig {
            name,
            docker_registry_host,
            short,
        } => {
            let out = registry::dig(&docker_registry_host, &name, short).await?;
            print!("{out}");
        }
    }

    Ok(())
}
