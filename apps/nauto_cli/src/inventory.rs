use anyhow::Result;
use nauto_model::Device;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct InventoryFile {
    pub devices: Vec<Device>,
}

pub fn load(path: &Path) -> Result<InventoryFile> {
    let data = std::fs::read_to_string(path)?;
    let inventory = serde_yaml::from_str(&data)?;
    Ok(inventory)
}
