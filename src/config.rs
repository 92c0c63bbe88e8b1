// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::{Error, Result};
use crate::types::{provisional_id, Node, NodeRole};
use std::path::Path;
use structopt::StructOpt;

/// Runtime configuration, parsed from the command line by the node binary or
/// filled in directly by embedders and tests.
#[derive(Clone, Debug, Default, StructOpt)]
#[structopt(name = "ps_node", about = "A parameter-server runtime node")]
pub struct Config {
    /// How many workers the computation expects. Only the scheduler cares.
    #[structopt(long, default_value = "0")]
    pub num_workers: usize,

    /// How many servers the computation expects. Only the scheduler cares.
    #[structopt(long, default_value = "0")]
    pub num_servers: usize,

    /// How many joined-but-idle nodes to tolerate beyond workers + servers.
    #[structopt(long, default_value = "0")]
    pub num_unused: usize,

    /// How many neighbouring servers replicate each server's shard.
    #[structopt(long, default_value = "0")]
    pub num_replicas: usize,

    /// This node's bootstrap string, e.g.
    /// `role:SCHEDULER,hostname:127.0.0.1,port:8000,id:'H'`. Omit it to
    /// auto-assemble an address from `--interface` and `--bind-to`.
    #[structopt(long)]
    pub my_node: Option<String>,

    /// The scheduler's bootstrap string. Required.
    #[structopt(long)]
    pub scheduler: String,

    /// Rank hint for auto-assembled nodes; only flavours the provisional id.
    #[structopt(long)]
    pub my_rank: Option<usize>,

    /// Port to listen on when auto-assembling; 0 picks an ephemeral port.
    #[structopt(long, default_value = "0")]
    pub bind_to: u16,

    /// Hostname or address to advertise when auto-assembling.
    #[structopt(long)]
    pub interface: Option<String>,

    /// Application configuration: a file path or inline text, handed to
    /// every node with the roster.
    #[structopt(long)]
    pub app: Option<String>,
}

impl Config {
    /// A minimal configuration pointing at `scheduler`.
    pub fn new(scheduler: impl Into<String>) -> Self {
        Self {
            scheduler: scheduler.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let scheduler = self.scheduler_node()?;
        if !scheduler.is_scheduler() {
            return Err(Error::InvalidConfig(format!(
                "--scheduler must have role SCHEDULER, got {:?}",
                scheduler.role
            )));
        }
        if self.my_node()?.is_scheduler() && self.num_workers + self.num_servers == 0 {
            return Err(Error::InvalidConfig(
                "the scheduler expects at least one worker or server".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_node(&self) -> Result<Node> {
        if self.scheduler.is_empty() {
            return Err(Error::InvalidConfig("--scheduler is required".to_string()));
        }
        self.scheduler.parse()
    }

    /// This node's own record: the parsed `--my-node` string, or one
    /// assembled from `--interface`/`--bind-to` with a provisional identity
    /// the scheduler will replace.
    pub fn my_node(&self) -> Result<Node> {
        if let Some(spec) = &self.my_node {
            return spec.parse();
        }
        let hostname = self
            .interface
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let id = provisional_id(&hostname, self.bind_to, NodeRole::Unused);
        Ok(Node::new(id, NodeRole::Unused, hostname, self.bind_to))
    }

    /// The application configuration text: the contents of `--app` if it
    /// names a readable file, otherwise the flag value itself.
    pub fn app_conf(&self) -> Result<Option<String>> {
        match &self.app {
            None => Ok(None),
            Some(spec) if Path::new(spec).is_file() => {
                Ok(Some(std::fs::read_to_string(spec)?))
            }
            Some(text) => Ok(Some(text.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_round_trip() -> eyre::Result<()> {
        let config = Config::from_iter([
            "ps_node",
            "--num-workers",
            "2",
            "--num-servers",
            "3",
            "--scheduler",
            "role:SCHEDULER,hostname:127.0.0.1,port:8000,id:'H'",
            "--my-node",
            "role:SCHEDULER,hostname:127.0.0.1,port:8000,id:'H'",
        ]);
        config.validate()?;
        assert_eq!(config.num_workers, 2);
        assert!(config.my_node()?.is_scheduler());
        assert_eq!(config.scheduler_node()?.id, "H");
        Ok(())
    }

    #[test]
    fn auto_assembled_node_gets_a_provisional_id() -> eyre::Result<()> {
        let mut config = Config::new("role:SCHEDULER,hostname:127.0.0.1,port:8000");
        config.bind_to = 7777;
        let node = config.my_node()?;
        assert_eq!(node.id, "N_127.0.0.1:7777");
        assert_eq!(node.role, NodeRole::Unused);
        Ok(())
    }

    #[test]
    fn scheduler_needs_a_fleet() {
        let spec = "role:SCHEDULER,hostname:127.0.0.1,port:8000";
        let mut config = Config::new(spec);
        config.my_node = Some(spec.to_string());
        assert!(config.validate().is_err());
        config.num_workers = 1;
        assert!(config.validate().is_ok());
    }
}
