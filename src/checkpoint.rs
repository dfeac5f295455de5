use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use candle_core::Device;

use crate::model::WeightSnapshot;
use crate::trainer::Trainer;

pub const EXTENSION: &str = "safetensors";

/// Appends `.safetensors` unless the path already ends with it.
pub fn checkpoint_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match path.extension() {
        Some(ext) if ext == EXTENSION => path.to_path_buf(),
        _ => {
            let mut name = path.as_os_str().to_owned();
            name.push(".");
            name.push(EXTENSION);
            PathBuf::from(name)
        }
    }
}

pub fn save_snapshot(snapshot: &WeightSnapshot, path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = checkpoint_path(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    candle_core::safetensors::save(snapshot, &path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

pub fn load_snapshot(path: impl AsRef<Path>, device: &Device) -> Result<WeightSnapshot> {
    let path = checkpoint_path(path);
    ensure!(path.exists(), "checkpoint {} does not exist", path.display());
    let tensors = candle_core::safetensors::load(&path, device)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(tensors)
}

impl Trainer {
    /// Writes the best weights seen so far.
    pub fn save_model(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = save_snapshot(self.best_snapshot(), path)?;
        tracing::info!(path = %path.display(), tensors = self.best_snapshot().len(), "model saved");
        Ok(path)
    }

    /// Loads weights into the model and makes them the best snapshot.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = load_snapshot(&path, &self.model().device)?;
        self.model().restore(&snapshot)?;
        self.set_best_snapshot(snapshot);
        tracing::info!(path = %checkpoint_path(path).display(), "model loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainConfig;
    use crate::model::tests::{random_input, tiny_config};
    use crate::model::TsModel;

    #[test]
    fn extension_is_appended_once() {
        assert_eq!(checkpoint_path("out/model"), PathBuf::from("out/model.safetensors"));
        assert_eq!(checkpoint_path("model.safetensors"), PathBuf::from("model.safetensors"));
        assert_eq!(checkpoint_path("model.v1"), PathBuf::from("model.v1.safetensors"));
    }

    #[test]
    fn save_then_load_restores_predictions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let config = tiny_config();
        let features = random_input(3, &config, &device)?;

        let source = Trainer::new(TsModel::new(&config, &device)?, TrainConfig::default())?;
        let expected = source.model().predict(&features)?.flatten_all()?.to_vec1::<f32>()?;
        let path = source.save_model(dir.path().join("nested/best"))?;
        assert!(path.ends_with("nested/best.safetensors"));

        let mut target = Trainer::new(TsModel::new(&config, &device)?, TrainConfig::default())?;
        target.load_model(dir.path().join("nested/best"))?;
        let got = target.model().predict(&features)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(expected, got);
        Ok(())
    }

    #[test]
    fn missing_checkpoint_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut trainer = Trainer::new(TsModel::new(&tiny_config(), &Device::Cpu)?, TrainConfig::default())?;
        assert!(trainer.load_model(dir.path().join("absent")).is_err());
        Ok(())
    }
}
