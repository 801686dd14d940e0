use crate::framework::errors::FerrumStreamError;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOSTNAME: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 55551;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_reduce_workers() -> usize {
    1
}

fn default_reduce_shard_buffer() -> usize {
    64
}

fn default_response_buffer() -> usize {
    16
}

fn default_response_batch_size() -> usize {
    500
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(rename = "max.message.size", default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Workers sharing the partitions of a single reduce invocation.
    #[serde(rename = "reduce.workers", default = "default_reduce_workers")]
    pub reduce_workers: usize,

    #[serde(rename = "reduce.shard.buffer", default = "default_reduce_shard_buffer")]
    pub reduce_shard_buffer: usize,

    /// Outbound batches buffered before the reduce stream applies backpressure.
    #[serde(rename = "response.buffer", default = "default_response_buffer")]
    pub response_buffer: usize,

    #[serde(rename = "response.batch.size", default = "default_response_batch_size")]
    pub response_batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hostname: default_hostname(),
            port: default_port(),
            max_message_size: default_max_message_size(),
            reduce_workers: default_reduce_workers(),
            reduce_shard_buffer: default_reduce_shard_buffer(),
            response_buffer: default_response_buffer(),
            response_batch_size: default_response_batch_size(),
        }
    }
}

impl ServerConfig {
    pub fn from_xml_file(file_path: &str) -> Result<Self, FerrumStreamError> {
        let xml_str = std::fs::read_to_string(file_path).map_err(|err| {
            FerrumStreamError::ConfigError(format!("cannot read {}: {}", file_path, err))
        })?;
        Self::from_xml_str(&xml_str)
    }

    pub fn from_xml_str(xml_str: &str) -> Result<Self, FerrumStreamError> {
        let config: ServerConfig = serde_xml_rs::from_str(xml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FerrumStreamError> {
        let checks = [
            ("reduce.workers", self.reduce_workers),
            ("reduce.shard.buffer", self.reduce_shard_buffer),
            ("response.buffer", self.response_buffer),
            ("response.batch.size", self.response_batch_size),
            ("max.message.size", self.max_message_size),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(FerrumStreamError::ConfigError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn reduce(&self) -> ReduceConfig {
        ReduceConfig {
            workers: self.reduce_workers,
            shard_buffer: self.reduce_shard_buffer,
            batch_size: self.response_batch_size,
        }
    }
}

/// Per-invocation settings of the reduce engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReduceConfig {
    pub workers: usize,
    pub shard_buffer: usize,
    pub batch_size: usize,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        ServerConfig::default().reduce()
    }
}
