use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{MediaInfo, MediaTools, VideoAsset};
use crate::error::TranscodeError;

/// Target frame shape for Reels: 9:16, at most 1080x1920.
#[derive(Debug, Clone, Copy)]
pub struct TargetAspect {
    pub width: u32,
    pub height: u32,
    /// Absolute tolerance on width/height below which no crop happens.
    pub tolerance: f64,
}

impl Default for TargetAspect {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            tolerance: 0.01,
        }
    }
}

impl TargetAspect {
    pub fn ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropPlan {
    PassThrough,
    Crop {
        width: u32,
        height: u32,
        x: u32,
        y: u32,
        /// Downscale applied after the crop; never larger than the crop itself.
        scale: Option<(u32, u32)>,
    },
}

impl CropPlan {
    /// ffmpeg `-vf` argument, `None` for pass-through.
    pub fn filter(&self) -> Option<String> {
        match *self {
            CropPlan::PassThrough => None,
            CropPlan::Crop {
                width,
                height,
                x,
                y,
                scale,
            } => {
                let mut f = format!("crop={width}:{height}:{x}:{y}");
                if let Some((w, h)) = scale {
                    f.push_str(&format!(",scale={w}:{h}"));
                }
                Some(f)
            }
        }
    }

    /// Frame size after the plan is applied to a `width`x`height` source.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        match *self {
            CropPlan::PassThrough => (width, height),
            CropPlan::Crop {
                scale: Some(size), ..
            } => size,
            CropPlan::Crop { width, height, .. } => (width, height),
        }
    }
}

/// Nearest even integer; x264 with yuv420p rejects odd dimensions.
fn even(v: f64) -> u32 {
    ((v / 2.0).round() as u32) * 2
}

/// Center-crop plan that brings `width`x`height` to the target ratio.
///
/// Only one axis is cut. The frame is never upscaled; it is scaled down to the
/// target size only when the crop is larger than it.
pub fn plan_crop(width: u32, height: u32, target: &TargetAspect) -> Option<CropPlan> {
    if width == 0 || height == 0 {
        return None;
    }
    let ratio = width as f64 / height as f64;
    let target_ratio = target.ratio();
    if (ratio - target_ratio).abs() <= target.tolerance {
        return Some(CropPlan::PassThrough);
    }

    let (crop_w, crop_h) = if ratio > target_ratio {
        let w = even(height as f64 * target_ratio).min(width & !1);
        (w, height & !1)
    } else {
        let h = even(width as f64 / target_ratio).min(height & !1);
        (width & !1, h)
    };
    let scale = (crop_w > target.width && crop_h > target.height)
        .then_some((target.width, target.height));

    Some(CropPlan::Crop {
        width: crop_w,
        height: crop_h,
        x: (width - crop_w) / 2,
        y: (height - crop_h) / 2,
        scale,
    })
}

/// Bring `asset` to the target aspect ratio.
///
/// Already-vertical input comes back untouched. Otherwise the result lands
/// next to the input as `adjusted_<name>`; the input is left in place.
pub async fn normalize<M: MediaTools>(
    tools: &M,
    asset: &VideoAsset,
    target: &TargetAspect,
) -> Result<VideoAsset, TranscodeError> {
    let info = match asset.info {
        Some(info) => info,
        None => tools
            .probe(&asset.path)
            .await
            .map_err(|e| TranscodeError::Failed {
                path: asset.path.clone(),
                message: e.to_string(),
            })?,
    };

    let plan = plan_crop(info.width, info.height, target)
        .ok_or_else(|| TranscodeError::UnknownDimensions(asset.path.clone()))?;
    if plan == CropPlan::PassThrough {
        debug!("{} is already {}x{}-shaped", asset.path.display(), target.width, target.height);
        return Ok(asset.clone());
    }

    let output = adjusted_path(&asset.path);
    let (width, height) = plan.output_size(info.width, info.height);
    let adjusted = VideoAsset {
        id: asset.id.clone(),
        path: output.clone(),
        info: Some(MediaInfo {
            width,
            height,
            ..info
        }),
    };

    if file_len(&output).await > 0 {
        info!("Adjusted file already exists for {}; reusing it", asset.path.display());
        return Ok(adjusted);
    }

    info!(
        "Adjusting {} from {}x{} to {}x{}",
        asset.path.display(),
        info.width,
        info.height,
        width,
        height
    );
    // ffmpeg writes next to the final name; only a finished file is renamed into place.
    let partial = partial_path(&output);
    if let Err(e) = tools.transcode(&asset.path, &partial, &plan).await {
        remove_partial(&partial).await;
        return Err(e);
    }
    if file_len(&partial).await == 0 {
        remove_partial(&partial).await;
        return Err(TranscodeError::EmptyOutput(output));
    }
    tokio::fs::rename(&partial, &output).await?;
    info!("Adjusted video saved to {}", output.display());
    Ok(adjusted)
}

pub fn adjusted_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video.mp4".to_string());
    path.with_file_name(format!("adjusted_{name}"))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not delete partial output {}: {}", path.display(), e);
        }
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}
