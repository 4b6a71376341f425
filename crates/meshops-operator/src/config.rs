//! Command line and environment configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use kube::Client;

use meshops_addon::deployer::DEFAULT_IMAGE_REPOSITORY;
use meshops_clients::{ConnectionResolver, ControlPlaneResolver, MeshKind, StaticFileResolver};
use meshops_common::MESHOPS_SYSTEM_NAMESPACE;

/// meshops - managed mesh-manager addon operator
#[derive(Parser, Debug)]
#[command(name = "meshops", version, about, long_about = None)]
pub struct Cli {
    /// Kubeconfig for the managing cluster (inferred when omitted)
    #[arg(long, global = true, env = "MESHOPS_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Where target cluster credentials come from
    #[arg(
        long,
        global = true,
        value_enum,
        env = "MESHOPS_RESOLVER",
        default_value_t = ResolverKind::ControlPlane
    )]
    pub resolver: ResolverKind,

    /// Directory of `<cluster>.yaml` kubeconfig files (static resolver)
    #[arg(long, global = true, env = "MESHOPS_KUBECONFIG_DIR")]
    pub kubeconfig_dir: Option<PathBuf>,

    /// Namespace holding `<cluster>-kubeconfig` Secrets (control-plane resolver)
    #[arg(
        long,
        global = true,
        env = "MESHOPS_KUBECONFIG_NAMESPACE",
        default_value = MESHOPS_SYSTEM_NAMESPACE
    )]
    pub kubeconfig_namespace: String,

    /// Base URL of the mesh topology registry
    #[arg(long, global = true, env = "MESHOPS_TOPOLOGY_URL")]
    pub topology_url: Option<String>,

    /// Number of concurrent sync workers
    #[arg(long, global = true, env = "MESHOPS_WORKERS", default_value_t = 10)]
    pub workers: usize,

    /// Image repository of the mesh manager; the addon version is the tag
    #[arg(
        long,
        global = true,
        env = "MESHOPS_IMAGE_REPOSITORY",
        default_value = DEFAULT_IMAGE_REPOSITORY
    )]
    pub image_repository: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Source of target cluster connections
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ResolverKind {
    /// Kubeconfig Secrets on the managing cluster
    ControlPlane,
    /// Kubeconfig files in a local directory
    Static,
}

/// Operator subcommands
#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the MeshAddon controller (default)
    Run {
        /// Do not apply the MeshAddon CRD on startup
        #[arg(long)]
        skip_crd_install: bool,
    },

    /// Print the MeshAddon CRD as YAML and exit
    Crd,

    /// Show the clusters and primaries of a mesh
    Topology {
        /// Mesh name
        mesh: String,
    },

    /// List mesh resources on every primary cluster of a mesh
    MeshResources {
        /// Mesh name
        mesh: String,

        /// Resource kind, e.g. VirtualService or gateways
        #[arg(long, value_parser = parse_mesh_kind)]
        kind: MeshKind,

        /// Only list this namespace
        #[arg(long, short)]
        namespace: Option<String>,
    },
}

fn parse_mesh_kind(s: &str) -> Result<MeshKind, String> {
    MeshKind::parse(s).ok_or_else(|| {
        let known: Vec<&str> = MeshKind::ALL.iter().map(MeshKind::kind).collect();
        format!("unknown mesh kind {s:?}, expected one of {}", known.join(", "))
    })
}

impl Cli {
    /// Subcommand to execute, `run` when none was given
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run {
            skip_crd_install: false,
        })
    }

    /// Check option combinations clap cannot express
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resolver == ResolverKind::Static && self.kubeconfig_dir.is_none() {
            anyhow::bail!("--kubeconfig-dir is required with --resolver static");
        }
        if self.workers == 0 {
            anyhow::bail!("--workers must be at least 1");
        }
        if matches!(self.command(), Command::Topology { .. } | Command::MeshResources { .. })
            && self.topology_url.is_none()
        {
            anyhow::bail!("--topology-url is required to inspect a mesh");
        }
        Ok(())
    }

    /// Build the configured connection resolver
    pub fn connection_resolver(&self, client: &Client) -> anyhow::Result<ConnectionResolver> {
        match self.resolver {
            ResolverKind::ControlPlane => Ok(ConnectionResolver::ControlPlane(
                ControlPlaneResolver::new(client.clone(), self.kubeconfig_namespace.clone()),
            )),
            ResolverKind::Static => {
                let dir = self
                    .kubeconfig_dir
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--kubeconfig-dir is required with --resolver static"))?;
                Ok(ConnectionResolver::StaticFile(StaticFileResolver::new(dir)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("meshops").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn defaults_to_run_with_control_plane_resolver() {
        let cli = parse(&[]);
        assert_eq!(cli.command(), Command::Run { skip_crd_install: false });
        assert_eq!(cli.resolver, ResolverKind::ControlPlane);
        assert_eq!(cli.kubeconfig_namespace, MESHOPS_SYSTEM_NAMESPACE);
        assert_eq!(cli.workers, 10);
        assert_eq!(cli.image_repository, DEFAULT_IMAGE_REPOSITORY);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = parse(&["run", "--workers", "3", "--skip-crd-install"]);
        assert_eq!(cli.workers, 3);
        assert_eq!(cli.command(), Command::Run { skip_crd_install: true });
    }

    #[test]
    fn static_resolver_requires_directory() {
        let cli = parse(&["--resolver", "static"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--resolver", "static", "--kubeconfig-dir", "/etc/meshops/clusters"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(parse(&["--workers", "0"]).validate().is_err());
    }

    #[rstest]
    #[case("VirtualService", MeshKind::VirtualService)]
    #[case("gateways", MeshKind::Gateway)]
    #[case("serviceentry", MeshKind::ServiceEntry)]
    fn mesh_resources_parses_kind(#[case] arg: &str, #[case] expected: MeshKind) {
        let cli = parse(&[
            "mesh-resources",
            "prod",
            "--kind",
            arg,
            "--topology-url",
            "http://registry:8080",
        ]);
        assert_eq!(
            cli.command(),
            Command::MeshResources {
                mesh: "prod".to_string(),
                kind: expected,
                namespace: None,
            }
        );
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result = Cli::try_parse_from(["meshops", "mesh-resources", "prod", "--kind", "pods"]);
        assert!(result.is_err());
    }

    #[test]
    fn inspection_requires_topology_url() {
        assert!(parse(&["topology", "prod"]).validate().is_err());
        assert!(parse(&["topology", "prod", "--topology-url", "http://registry:8080"])
            .validate()
            .is_ok());
    }
}
