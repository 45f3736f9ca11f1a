//! Build the configured tree in-process and drive signing rounds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tracing::{error, info, warn};

use cosi_common::merkle::proof_tree;
use cosi_common::suite::Keypair;
use cosi_common::{check_proof, Config, HashId};
use cosi_net::{Directory, TreeHost};
use cosi_sign::{FailureSim, Node, SignError, VerifyPolicy};

use crate::cli::{App, Cli};

/// A node's batch of pending client stamp requests.
///
/// Stands in for the client-facing stamp RPC: each round the commit
/// callback summarises the pending digests into one local Merkle root,
/// and the done callback checks the returned inclusion proof against the
/// collectively signed global root.
struct Timestamper {
    name: String,
    pending: Mutex<Vec<HashId>>,
}

impl Timestamper {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Timestamper {
            name: name.to_string(),
            pending: Mutex::new(Vec::new()),
        })
    }

    fn queue(&self, digest: HashId) {
        self.pending.lock().push(digest);
    }

    /// Local Merkle root over the pending batch (zero when empty).
    fn local_root(&self) -> HashId {
        let mut digests = self.pending.lock().clone();
        digests.sort();
        let (root, _) = proof_tree(&digests);
        root
    }
}

/// The whole tree, wired and listening.
pub struct Deployment {
    pub names: Vec<String>,
    pub nodes: HashMap<String, Arc<Node>>,
}

impl Deployment {
    pub fn root(&self) -> &Arc<Node> {
        &self.nodes[&self.names[0]]
    }

    pub fn close(&self) {
        for node in self.nodes.values() {
            node.close();
        }
    }
}

/// Construct hosts and nodes for every configured participant.
pub async fn build_deployment(config: &Config, cli: &Cli) -> anyhow::Result<Deployment> {
    let names = config.host_list();
    let tree = config.tree();
    let parents = config.parent_map();
    let root_name = config.root();

    let keypairs: HashMap<String, Keypair> = names
        .iter()
        .map(|name| (name.clone(), Keypair::generate(&mut OsRng)))
        .collect();

    let directory = Arc::new(Directory::new());
    let mut nodes = HashMap::new();

    for name in &names {
        let host = TreeHost::new(name.clone(), Arc::clone(&directory));
        let children: Vec<&str> = tree[name].iter().map(String::as_str).collect();
        if !children.is_empty() {
            host.add_children(&children)
                .with_context(|| format!("wiring children of {name}"))?;
        }
        if let Some(parent) = parents.get(name) {
            host.add_parent(parent)
                .with_context(|| format!("wiring parent of {name}"))?;
        }

        let node = Node::new(
            host,
            keypairs[name].clone(),
            VerifyPolicy { debug: cli.debug },
        );
        node.set_default_timeout(Duration::from_millis(config.default_timeout_ms));
        node.set_height(config.height_of(name));
        node.set_host_list(names.clone());
        node.set_tree(tree.clone());
        for (peer, keypair) in &keypairs {
            node.add_peer(peer, keypair.public);
        }

        if cli.failures > 0 && name != &root_name {
            node.set_failure_sim(FailureSim::new(name, cli.failures));
        }
        if name == &root_name {
            node.set_fail_as_root_every(cli.rfail);
        } else {
            node.set_fail_as_follower_every(cli.ffail);
        }

        if cli.app == App::Time {
            install_timestamper(&node, name);
        }

        nodes.insert(name.clone(), node);
    }

    // Parents before children: host_list is in tree order from the root.
    for name in &names {
        nodes[name]
            .listen()
            .await
            .with_context(|| format!("starting {name}"))?;
    }

    Ok(Deployment {
        names: {
            let mut ordered = names;
            // The driving root goes first.
            ordered.retain(|n| n != &root_name);
            ordered.insert(0, root_name);
            ordered
        },
        nodes,
    })
}

fn install_timestamper(node: &Arc<Node>, name: &str) {
    let stamper = Timestamper::new(name);

    // Synthetic client load: a few digests queued per round.
    let for_commit = Arc::clone(&stamper);
    node.register_commit_fn(Box::new(move || {
        for i in 0..4u8 {
            let digest = HashId::hash_parts(&[for_commit.name.as_bytes(), &[i]]);
            for_commit.queue(digest);
        }
        for_commit.local_root()
    }));

    let for_done = Arc::clone(&stamper);
    node.register_done_fn(Box::new(move |event| {
        let ok = check_proof(&event.global_root, &event.local_root, &event.proof);
        if ok {
            info!(
                node = %for_done.name,
                round = event.round,
                global_root = %event.global_root,
                "stamp batch included in signed root"
            );
            for_done.pending.lock().clear();
        } else {
            error!(
                node = %for_done.name,
                round = event.round,
                "inclusion proof did not verify"
            );
        }
    }));
}

/// Drive `cli.rounds` signing rounds from the root.
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    if cli.suite != "ed25519" {
        bail!("unsupported suite '{}', only 'ed25519' is available", cli.suite);
    }
    if let Some(hostname) = &cli.hostname {
        warn!(%hostname, "--hostname is reserved for networked deployments; running the full tree");
    }

    let config = Config::load_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let deployment = build_deployment(&config, cli).await?;
    let root = deployment.root();

    info!(hosts = deployment.names.len(), rounds = cli.rounds, "tree is up");

    let mut completed = 0u64;
    for i in 0..cli.rounds {
        let statement = format!("Hello World{i}");
        match root.start_signing_round(statement.into_bytes()).await {
            Ok(signature) => {
                completed += 1;
                info!(
                    round = signature.round,
                    root = %signature.mt_root,
                    exceptions = signature.exception_keys.len(),
                    "round signed"
                );
            }
            Err(SignError::ChangingView) => {
                warn!(round = i + 1, "view change in progress, skipping round");
            }
            Err(err) => {
                error!(round = i + 1, %err, "round failed");
            }
        }
    }

    let chain_ok = root.with_acc_log(|log| log.verify_chain());
    if !chain_ok {
        deployment.close();
        bail!("accountability chain failed to verify");
    }

    info!(completed, attempted = cli.rounds, "shutting down");
    deployment.close();

    if completed == 0 && cli.rounds > 0 {
        bail!("no round completed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    const CONFIG: &str = r#"
        [[hosts]]
        name = "host0"
        children = ["host1", "host2"]

        [[hosts]]
        name = "host1"

        [[hosts]]
        name = "host2"
    "#;

    fn cli_with_config(path: &std::path::Path, extra: &[&str]) -> Cli {
        let mut args = vec!["cosi-node", "--config", path.to_str().unwrap()];
        args.extend_from_slice(extra);
        Cli::parse_from(args)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sign_app_end_to_end() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "{CONFIG}").unwrap();
        let cli = cli_with_config(tmp.path(), &["--rounds", "2"]);
        run(&cli).await.expect("two signing rounds");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_time_app_end_to_end() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "{CONFIG}").unwrap();
        let cli = cli_with_config(tmp.path(), &["--app", "time"]);
        run(&cli).await.expect("timestamping round");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_suite_refused() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "{CONFIG}").unwrap();
        let cli = cli_with_config(tmp.path(), &["--suite", "nist256"]);
        assert!(run(&cli).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_config_is_fatal() {
        let cli = Cli::parse_from(["cosi-node", "--config", "/nonexistent/tree.toml"]);
        assert!(run(&cli).await.is_err());
    }
}
