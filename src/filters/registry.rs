//! Family-tag → constructor registry used when reloading saved graphs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{DogBank, FilterBank, FilterFamily, FilterParams, GaborBank, LowPassBank};
use crate::error::{Error, Result};

/// Persisted form of a bank: the family tag plus its raw parameter object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitializerConfig {
    pub family: String,
    pub config: serde_json::Value,
}

impl InitializerConfig {
    pub fn from_params(params: &FilterParams) -> Result<Self> {
        let config = match params {
            FilterParams::Gabor(p) => serde_json::to_value(p)?,
            FilterParams::Dog(p) => serde_json::to_value(p)?,
            FilterParams::LowPass(p) => serde_json::to_value(p)?,
        };
        Ok(Self {
            family: params.family().tag().to_string(),
            config,
        })
    }
}

pub type Constructor = fn(serde_json::Value) -> Result<Box<dyn FilterBank>>;

pub struct InitializerRegistry {
    constructors: BTreeMap<String, Constructor>,
}

fn key(tag: &str) -> String {
    tag.trim().to_ascii_lowercase()
}

impl InitializerRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the three built-in families.
    pub fn standard() -> Self {
        let mut reg = Self::empty();
        reg.register(FilterFamily::Gabor.tag(), |v| {
            Ok(Box::new(GaborBank::new(serde_json::from_value(v)?)?))
        });
        reg.register(FilterFamily::Dog.tag(), |v| {
            Ok(Box::new(DogBank::new(serde_json::from_value(v)?)?))
        });
        reg.register(FilterFamily::LowPass.tag(), |v| {
            Ok(Box::new(LowPassBank::new(serde_json::from_value(v)?)?))
        });
        reg
    }

    pub fn register(&mut self, tag: &str, constructor: Constructor) {
        self.constructors.insert(key(tag), constructor);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(&key(tag))
    }

    pub fn resolve(&self, init: &InitializerConfig) -> Result<Box<dyn FilterBank>> {
        let constructor = self.constructors.get(&key(&init.family)).ok_or_else(|| {
            Error::Config(format!("no initializer registered for family {:?}", init.family))
        })?;
        constructor(init.config.clone())
    }
}

impl Default for InitializerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
