use rdmx_verbs::config::InvalidConfig;
use serde::{Deserialize, Serialize};

use crate::policy::{AllowAll, AllowList, DenyAll, ExecutionPolicy};

/// Size of the server's executable region.
pub const DEFAULT_MAX_CODE_SIZE: usize = 3 * 1024 * 1024;

/// Which requests the server agrees to execute.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfig {
    #[default]
    AllowAll,
    DenyAll,
    AllowList { functions: Vec<String> },
}

impl PolicyConfig {
    pub fn build(&self) -> Box<dyn ExecutionPolicy> {
        match self {
            PolicyConfig::AllowAll => Box::new(AllowAll),
            PolicyConfig::DenyAll => Box::new(DenyAll),
            PolicyConfig::AllowList { functions } => Box::new(AllowList::new(functions.iter().cloned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LambdaConfig {
    /// Largest code the server accepts and the client sends.
    #[serde(default = "default_max_code_size")]
    pub max_code_size: usize,

    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_max_code_size() -> usize {
    DEFAULT_MAX_CODE_SIZE
}

impl Default for LambdaConfig {
    fn default() -> Self {
        Self {
            max_code_size: default_max_code_size(),
            policy: PolicyConfig::default(),
        }
    }
}

impl LambdaConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.max_code_size == 0 {
            return Err(InvalidConfig::new("lambda", "max_code_size must be positive"));
        }
        if let PolicyConfig::AllowList { functions } = &self.policy {
            if functions.is_empty() {
                return Err(InvalidConfig::new(
                    "lambda",
                    "allow_list policy needs at least one function",
                ));
            }
        }
        Ok(())
    }
}
