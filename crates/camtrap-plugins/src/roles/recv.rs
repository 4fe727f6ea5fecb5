//! Receive acknowledger: answers every `NewImage` with `ImageReceived`,
//! optionally keeping a copy of the image on disk.

use async_trait::async_trait;
use camtrap_core::config::RecvConfig;
use camtrap_events::{Event, ImageReceived, NewImage};
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dispatcher::{EventHandler, Flow, PluginContext};
use crate::error::PluginResult;

/// `<images_dir>/<prefix><uuid>.<format>`, format lower-cased
pub fn image_path(config: &RecvConfig, image_uuid: &Uuid, image_format: &str) -> PathBuf {
    config.images_dir.join(format!(
        "{}{}.{}",
        config.image_file_prefix,
        image_uuid,
        image_format.to_ascii_lowercase()
    ))
}

pub struct RecvHandler {
    config: RecvConfig,
    received: u64,
}

impl RecvHandler {
    pub fn new(config: RecvConfig) -> Self {
        Self { config, received: 0 }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    async fn write_image(&self, image: &NewImage) -> std::io::Result<PathBuf> {
        let path = image_path(&self.config, &image.image_uuid, &image.image_format);
        tokio::fs::create_dir_all(&self.config.images_dir).await?;
        tokio::fs::write(&path, &image.image).await?;
        Ok(path)
    }
}

#[async_trait]
impl EventHandler for RecvHandler {
    async fn handle(&mut self, event: Event, ctx: &mut PluginContext) -> PluginResult<Flow> {
        let Event::NewImage(image) = event else {
            return Ok(Flow::Continue);
        };

        if self.config.write_images {
            match self.write_image(&image).await {
                Ok(path) => debug!(image_uuid = %image.image_uuid, path = %path.display(), "Image written"),
                // Acknowledged regardless.
                Err(e) => warn!(image_uuid = %image.image_uuid, error = %e, "Failed to write image"),
            }
        }

        self.received += 1;
        ctx.publish(ImageReceived::new(image.image_uuid, image.image_format))
            .await?;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camtrap_events::ids::image_uuid;

    #[test]
    fn test_image_path_layout() {
        let config = RecvConfig {
            write_images: true,
            images_dir: PathBuf::from("/data/images"),
            image_file_prefix: "cam1-".to_string(),
        };
        let id = image_uuid("/images/001.JPG");
        assert_eq!(
            image_path(&config, &id, "JPG"),
            PathBuf::from(format!("/data/images/cam1-{id}.jpg"))
        );
    }

    #[tokio::test]
    async fn test_write_image_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let handler = RecvHandler::new(RecvConfig {
            write_images: true,
            images_dir: dir.path().join("out"),
            image_file_prefix: String::new(),
        });
        let image = NewImage::new(image_uuid("x.png"), "png", vec![0x89, b'P', b'N', b'G']);

        let path = handler.write_image(&image).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), image.image);
    }
}
