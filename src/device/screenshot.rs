//! 屏幕截图：真实截图或黑屏占位图（fallback），以及发送给模型前的压缩编码
//!
//! 截图被平台拒绝时 is_sensitive=true（通常意味着支付/密码等受保护页面），
//! 读取失败时 is_fallback=true；下游智能体据此区分「黑屏占位」与「空白应用」。

use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use image::{imageops::FilterType, DynamicImage, ImageOutputFormat, RgbImage};

use crate::config::ScreenshotSection;

/// 一次截图结果
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub image: DynamicImage,
    pub is_sensitive: bool,
    pub is_fallback: bool,
}

/// 截图的感知质量，写入各智能体的 prompt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Perception {
    pub is_sensitive: bool,
    pub is_fallback: bool,
}

impl Perception {
    pub fn is_degraded(&self) -> bool {
        self.is_sensitive || self.is_fallback
    }

    /// 降级时给模型的说明；正常截图返回 None
    pub fn note(&self) -> Option<&'static str> {
        if self.is_sensitive {
            Some(
                "The screenshot was refused by the system, so the image is a black placeholder. \
                 The current screen is most likely a protected page (payment, password or privacy). \
                 Do not assume the screen is empty.",
            )
        } else if self.is_fallback {
            Some(
                "The screenshot could not be read, so the image is a black placeholder. \
                 Do not assume the screen is empty.",
            )
        } else {
            None
        }
    }
}

/// 压缩参数：等比缩放到 max_width × max_height 以内，JPEG 质量 jpeg_quality
#[derive(Debug, Clone, Copy)]
pub struct EncodeSettings {
    pub max_width: u32,
    pub max_height: u32,
    pub jpeg_quality: u8,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            max_width: 720,
            max_height: 1280,
            jpeg_quality: 60,
        }
    }
}

impl From<&ScreenshotSection> for EncodeSettings {
    fn from(section: &ScreenshotSection) -> Self {
        Self {
            max_width: section.max_width,
            max_height: section.max_height,
            jpeg_quality: section.jpeg_quality,
        }
    }
}

impl Screenshot {
    pub fn captured(image: DynamicImage) -> Self {
        Self {
            image,
            is_sensitive: false,
            is_fallback: false,
        }
    }

    /// 与屏幕同尺寸的黑屏占位图
    pub fn fallback(width: u32, height: u32, is_sensitive: bool) -> Self {
        Self {
            image: DynamicImage::ImageRgb8(RgbImage::new(width.max(1), height.max(1))),
            is_sensitive,
            is_fallback: true,
        }
    }

    pub fn perception(&self) -> Perception {
        Perception {
            is_sensitive: self.is_sensitive,
            is_fallback: self.is_fallback,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    /// 缩放 + JPEG 压缩 + base64，得到 `data:image/jpeg;base64,...`
    pub fn to_data_url(&self, settings: &EncodeSettings) -> Result<String, image::ImageError> {
        let (w, h) = self.dimensions();
        let resized = if w > settings.max_width || h > settings.max_height {
            self.image
                .resize(settings.max_width, settings.max_height, FilterType::Triangle)
        } else {
            self.image.clone()
        };
        // JPEG 不支持 alpha 通道
        let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

        let mut buffer = Cursor::new(Vec::new());
        rgb.write_to(&mut buffer, ImageOutputFormat::Jpeg(settings.jpeg_quality))?;
        let bytes = buffer.into_inner();
        tracing::debug!(
            from = %format!("{}x{}", w, h),
            to = %format!("{}x{}", rgb.width(), rgb.height()),
            kb = bytes.len() / 1024,
            "screenshot compressed"
        );
        Ok(format!(
            "data:image/jpeg;base64,{}",
            general_purpose::STANDARD.encode(bytes)
        ))
    }
}
