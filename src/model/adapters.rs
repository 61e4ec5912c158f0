// src/model/adapters.rs

use crate::model::partner::Partner;
use serde::{Deserialize, Serialize};
use serde_json::Result as JsonResult;
use std::fs;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConfigData {
    pub partners: Vec<Partner>,
}

pub trait ConfigAdapter: Send + Sync {
    fn get_partners(&self) -> Vec<Partner>;
}

pub struct FileConfigAdapter {
    pub partners_file: String,
}

impl FileConfigAdapter {
    pub fn new(partners_file: &str) -> Self {
        Self {
            partners_file: partners_file.to_string(),
        }
    }
}

impl ConfigAdapter for FileConfigAdapter {
    fn get_partners(&self) -> Vec<Partner> {
        let content = fs::read_to_string(&self.partners_file).unwrap_or_else(|_| "[]".to_string());
        let config: JsonResult<Vec<Partner>> = serde_json::from_str(&content);
        config.unwrap_or_default()
    }
}
