// ============================================
// Converter - convert.rs
// ============================================
// Image conversion between common formats, plus building macOS .icns
// icons from a single source image.
//
// ICNS flow:
// 1. Crop the source to a centred square.
// 2. Render an iconset (icon_16x16.png, icon_16x16@2x.png, ...) for the
//    standard sizes between min_size and max_size.
// 3. Let Apple's iconutil assemble the .icns. Where iconutil is missing
//    or fails (any non-macOS system), encode the icons with the icns
//    crate instead.
// ============================================

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageFormat, Rgb, RgbImage};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::archive::ScratchDir;
use crate::progress::Reporter;
use crate::tools;

/// Sizes Apple's iconset format knows about
const STANDARD_SIZES: [u32; 7] = [16, 32, 64, 128, 256, 512, 1024];

/// Sizes that also get an "@2x" image at double resolution
const RETINA_PAIRS: [(u32, u32); 5] = [(16, 32), (32, 64), (128, 256), (256, 512), (512, 1024)];

/// ICO cannot store anything larger
const ICO_MAX_SIZE: u32 = 256;

/// Prefix of the scratch dir that holds the iconset
const ICNS_SCRATCH_PREFIX: &str = "converter_icns";

const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(
        "Unsupported output format: {0}. \
         Supported formats are: icns, png, jpg, jpeg, webp, bmp, gif, tiff, ico"
    )]
    UnsupportedFormat(String),

    #[error("Input file '{}' does not exist", .0.display())]
    InputNotFound(PathBuf),

    #[error("Invalid icon size range: min {min}, max {max}")]
    InvalidSizeRange { min: u32, max: u32 },

    #[error("No icons generated, cannot create ICNS file")]
    NoIcons,

    #[error("Error converting image to {format}: {source}")]
    Image {
        format: ImageTarget,
        #[source]
        source: ImageError,
    },

    #[error("Could not read image: {0}")]
    Decode(#[source] ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================
// OUTPUT FORMATS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageTarget {
    Icns,
    Png,
    Jpeg,
    Webp,
    Bmp,
    Gif,
    Tiff,
    Ico,
}

impl ImageTarget {
    /// The `image` crate format for everything except ICNS
    fn image_format(&self) -> Option<ImageFormat> {
        match self {
            ImageTarget::Icns => None,
            ImageTarget::Png => Some(ImageFormat::Png),
            ImageTarget::Jpeg => Some(ImageFormat::Jpeg),
            ImageTarget::Webp => Some(ImageFormat::WebP),
            ImageTarget::Bmp => Some(ImageFormat::Bmp),
            ImageTarget::Gif => Some(ImageFormat::Gif),
            ImageTarget::Tiff => Some(ImageFormat::Tiff),
            ImageTarget::Ico => Some(ImageFormat::Ico),
        }
    }
}

impl FromStr for ImageTarget {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "icns" => Ok(ImageTarget::Icns),
            "png" => Ok(ImageTarget::Png),
            "jpg" | "jpeg" => Ok(ImageTarget::Jpeg),
            "webp" => Ok(ImageTarget::Webp),
            "bmp" => Ok(ImageTarget::Bmp),
            "gif" => Ok(ImageTarget::Gif),
            "tiff" | "tif" => Ok(ImageTarget::Tiff),
            "ico" => Ok(ImageTarget::Ico),
            _ => Err(ConvertError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageTarget::Icns => "ICNS",
            ImageTarget::Png => "PNG",
            ImageTarget::Jpeg => "JPG",
            ImageTarget::Webp => "WEBP",
            ImageTarget::Bmp => "BMP",
            ImageTarget::Gif => "GIF",
            ImageTarget::Tiff => "TIFF",
            ImageTarget::Ico => "ICO",
        };
        f.write_str(name)
    }
}

// ============================================
// PUBLIC API
// ============================================

/// (width, height) of an image file
pub fn image_info(path: &Path) -> Result<(u32, u32), ConvertError> {
    let img = open_image(path)?;
    Ok(img.dimensions())
}

fn open_image(path: &Path) -> Result<DynamicImage, ConvertError> {
    if !path.exists() {
        return Err(ConvertError::InputNotFound(path.to_path_buf()));
    }
    image::open(path).map_err(ConvertError::Decode)
}

/// Convert `input` into `output` as `target`.
/// `min_size` / `max_size` only matter for ICNS; `max_size` defaults to
/// the side of the cropped square.
pub fn convert_image(
    input: &Path,
    output: &Path,
    target: ImageTarget,
    min_size: u32,
    max_size: Option<u32>,
    reporter: &mut Reporter,
) -> Result<(), ConvertError> {
    log::info!("Converting {} to {} ({})", input.display(), output.display(), target);
    let result = match target {
        ImageTarget::Icns => create_icns(input, output, min_size, max_size, reporter),
        other => convert_plain(input, output, other, reporter),
    };

    match &result {
        Ok(()) => reporter.step(
            format!("Successfully converted {} to {}", input.display(), output.display()),
            100.0,
        ),
        Err(e) => {
            log::error!("Conversion failed: {}", e);
            reporter.fail(e.to_string());
        }
    }
    result
}

// ============================================
// PLAIN FORMATS
// ============================================

fn convert_plain(
    input: &Path,
    output: &Path,
    target: ImageTarget,
    reporter: &mut Reporter,
) -> Result<(), ConvertError> {
    let img = open_image(input)?;
    reporter.step(format!("Loaded {}x{} image", img.width(), img.height()), 20.0);
    let wrap = |source: ImageError| ConvertError::Image { format: target, source };

    match target {
        ImageTarget::Jpeg => {
            reporter.step("Converting to RGB on a white background...", 40.0);
            let rgb = flatten_on_white(&img);
            let mut writer = BufWriter::new(File::create(output)?);
            JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
                .encode_image(&rgb)
                .map_err(wrap)?;
            writer.flush()?;
        }
        ImageTarget::Ico => {
            let img = if img.width() > ICO_MAX_SIZE || img.height() > ICO_MAX_SIZE {
                reporter.step(format!("Scaling down to fit {0}x{0}", ICO_MAX_SIZE), 40.0);
                img.resize(ICO_MAX_SIZE, ICO_MAX_SIZE, FilterType::Lanczos3)
            } else {
                img
            };
            DynamicImage::ImageRgba8(img.to_rgba8())
                .save_with_format(output, ImageFormat::Ico)
                .map_err(wrap)?;
        }
        other => {
            // Every remaining encoder accepts 8-bit RGBA
            let format = other
                .image_format()
                .ok_or_else(|| ConvertError::UnsupportedFormat(other.to_string()))?;
            DynamicImage::ImageRgba8(img.to_rgba8())
                .save_with_format(output, format)
                .map_err(wrap)?;
        }
    }
    Ok(())
}

/// Composite any transparency onto white; JPEG has no alpha channel
fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::from_pixel(rgba.width(), rgba.height(), Rgb([255, 255, 255]));
    for (x, y, px) in rgba.enumerate_pixels() {
        let [r, g, b, a] = px.0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}

// ============================================
// ICNS
// ============================================

/// One PNG of an iconset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconsetEntry {
    pub file_name: String,
    pub pixels: u32,
}

/// Which PNGs go into the iconset for a given size range
pub fn plan_iconset(min_size: u32, max_size: u32) -> Vec<IconsetEntry> {
    let mut entries = Vec::new();
    let mut generated = Vec::new();

    for size in STANDARD_SIZES {
        if size < min_size || size > max_size {
            continue;
        }
        entries.push(IconsetEntry {
            file_name: format!("icon_{0}x{0}.png", size),
            pixels: size,
        });
        generated.push(size);

        if let Some(&(_, retina)) = RETINA_PAIRS.iter().find(|(base, _)| *base == size) {
            if retina <= max_size {
                entries.push(IconsetEntry {
                    file_name: format!("icon_{0}x{0}@2x.png", size),
                    pixels: retina,
                });
                generated.push(retina);
            }
        }
    }

    if !generated.contains(&max_size) {
        entries.push(IconsetEntry {
            file_name: format!("icon_{0}x{0}.png", max_size),
            pixels: max_size,
        });
    }
    entries
}

/// Crop the largest centred square out of an image
fn crop_to_square(img: DynamicImage) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w == h {
        return img;
    }
    let side = w.min(h);
    img.crop_imm((w - side) / 2, (h - side) / 2, side, side)
}

fn create_icns(
    input: &Path,
    output: &Path,
    min_size: u32,
    max_size: Option<u32>,
    reporter: &mut Reporter,
) -> Result<(), ConvertError> {
    let img = open_image(input)?;
    reporter.step(format!("Source image size: {}x{}", img.width(), img.height()), 10.0);

    if img.width() != img.height() {
        reporter.step("Warning: Image is not square. Cropping to square.", 15.0);
    }
    let img = crop_to_square(img);
    let max_size = max_size.unwrap_or_else(|| img.width());
    if min_size == 0 || max_size == 0 || min_size > max_size {
        return Err(ConvertError::InvalidSizeRange {
            min: min_size,
            max: max_size,
        });
    }

    let plan = plan_iconset(min_size, max_size);
    // Removed when `work` drops, whatever the outcome
    let work = ScratchDir::new(ICNS_SCRATCH_PREFIX)?;
    let iconset_dir = work.path().join("iconset.iconset");
    fs::create_dir_all(&iconset_dir)?;

    for (idx, entry) in plan.iter().enumerate() {
        let resized = img.resize_exact(entry.pixels, entry.pixels, FilterType::Lanczos3);
        resized
            .save_with_format(iconset_dir.join(&entry.file_name), ImageFormat::Png)
            .map_err(|source| ConvertError::Image {
                format: ImageTarget::Png,
                source,
            })?;
        reporter.step(
            format!("Generating size: {0}x{0}", entry.pixels),
            20.0 + 60.0 * (idx + 1) as f32 / plan.len() as f32,
        );
    }

    reporter.step("Creating ICNS file with iconutil...", 90.0);
    match run_iconutil(&iconset_dir, output) {
        Ok(()) => Ok(()),
        Err(reason) => {
            log::info!("iconutil unavailable ({}), using built-in encoder", reason);
            reporter.step("Falling back to built-in ICNS encoder...", 90.0);
            write_icns_fallback(&iconset_dir, output)
        }
    }
}

/// `iconutil -c icns <iconset> -o <output>`; Err carries the reason it
/// could not be used
fn run_iconutil(iconset_dir: &Path, output: &Path) -> Result<(), String> {
    let program = tools::find_tool(&tools::ICONUTIL).ok_or_else(|| "not installed".to_string())?;
    let args: [&std::ffi::OsStr; 5] = [
        "-c".as_ref(),
        "icns".as_ref(),
        iconset_dir.as_os_str(),
        "-o".as_ref(),
        output.as_os_str(),
    ];
    let run = tools::run_tool(&program, args).map_err(|e| e.to_string())?;
    if run.success {
        Ok(())
    } else {
        Err(format!("Error creating ICNS with iconutil: {}", run.failure_message()))
    }
}

/// Encode every iconset PNG the icns crate has an icon type for.
/// Each pixel size is stored once; unsupported sizes are skipped.
fn write_icns_fallback(iconset_dir: &Path, output: &Path) -> Result<(), ConvertError> {
    let mut pngs: Vec<PathBuf> = fs::read_dir(iconset_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "png").unwrap_or(false))
        .collect();
    pngs.sort();

    let mut family = icns::IconFamily::new();
    let mut stored: Vec<u32> = Vec::new();
    for png in pngs {
        let rgba = image::open(&png).map_err(ConvertError::Decode)?.to_rgba8();
        let (w, h) = rgba.dimensions();
        if stored.contains(&w) {
            continue;
        }
        let icon = icns::Image::from_data(icns::PixelFormat::RGBA, w, h, rgba.into_raw())?;
        match family.add_icon(&icon) {
            Ok(()) => stored.push(w),
            Err(e) => log::debug!("Skipping {}x{} icon: {}", w, h, e),
        }
    }

    if stored.is_empty() {
        return Err(ConvertError::NoIcons);
    }
    let mut writer = BufWriter::new(File::create(output)?);
    family.write(&mut writer)?;
    writer.flush()?;
    log::info!("Wrote {} with sizes {:?}", output.display(), stored);
    Ok(())
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    /// Half-transparent red rectangle
    fn write_sample_png(path: &Path, w: u32, h: u32) {
        let img = RgbaImage::from_pixel(w, h, Rgba([255, 0, 0, 128]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("jpg".parse::<ImageTarget>().unwrap(), ImageTarget::Jpeg);
        assert_eq!("JPEG".parse::<ImageTarget>().unwrap(), ImageTarget::Jpeg);
        assert_eq!("icns".parse::<ImageTarget>().unwrap(), ImageTarget::Icns);
        assert!(matches!(
            "psd".parse::<ImageTarget>(),
            Err(ConvertError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_plan_iconset_full_range() {
        let plan = plan_iconset(16, 1024);
        let names: Vec<&str> = plan.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "icon_16x16.png",
                "icon_16x16@2x.png",
                "icon_32x32.png",
                "icon_32x32@2x.png",
                "icon_64x64.png",
                "icon_128x128.png",
                "icon_128x128@2x.png",
                "icon_256x256.png",
                "icon_256x256@2x.png",
                "icon_512x512.png",
                "icon_512x512@2x.png",
                "icon_1024x1024.png",
            ]
        );
    }

    #[test]
    fn test_plan_iconset_adds_odd_max_size() {
        let plan = plan_iconset(16, 300);
        let last = plan.last().unwrap();
        assert_eq!(last.file_name, "icon_300x300.png");
        assert_eq!(last.pixels, 300);
        // 256@2x would be 512, above the max
        assert!(plan.iter().all(|e| e.pixels <= 300));
        assert!(!plan.iter().any(|e| e.file_name == "icon_256x256@2x.png"));
    }

    #[test]
    fn test_plan_iconset_respects_min_size() {
        let plan = plan_iconset(128, 256);
        let sizes: Vec<u32> = plan.iter().map(|e| e.pixels).collect();
        assert_eq!(sizes, vec![128, 256, 256]);
    }

    #[test]
    fn test_flatten_on_white() {
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        img.put_pixel(1, 0, Rgba([10, 20, 30, 255]));
        let flat = flatten_on_white(&DynamicImage::ImageRgba8(img));
        assert_eq!(flat.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(flat.get_pixel(1, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_crop_to_square_is_centred() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(300, 200));
        let cropped = crop_to_square(img);
        assert_eq!(cropped.dimensions(), (200, 200));
    }

    #[test]
    fn test_png_to_jpeg() {
        let work = tempfile::tempdir().unwrap();
        let input = work.path().join("in.png");
        let output = work.path().join("out.jpg");
        write_sample_png(&input, 40, 30);

        convert_image(&input, &output, ImageTarget::Jpeg, 16, None, &mut Reporter::silent()).unwrap();

        let decoded = image::open(&output).unwrap();
        assert_eq!(decoded.dimensions(), (40, 30));
        assert!(!decoded.color().has_alpha());
    }

    #[test]
    fn test_large_png_to_ico_is_scaled() {
        let work = tempfile::tempdir().unwrap();
        let input = work.path().join("big.png");
        let output = work.path().join("out.ico");
        write_sample_png(&input, 512, 512);

        convert_image(&input, &output, ImageTarget::Ico, 16, None, &mut Reporter::silent()).unwrap();
        assert_eq!(image_info(&output).unwrap(), (256, 256));
    }

    #[test]
    fn test_png_to_bmp_and_info() {
        let work = tempfile::tempdir().unwrap();
        let input = work.path().join("in.png");
        let output = work.path().join("out.bmp");
        write_sample_png(&input, 17, 9);

        assert_eq!(image_info(&input).unwrap(), (17, 9));
        convert_image(&input, &output, ImageTarget::Bmp, 16, None, &mut Reporter::silent()).unwrap();
        assert_eq!(image_info(&output).unwrap(), (17, 9));
    }

    #[test]
    fn test_icns_fallback_writer() {
        let work = tempfile::tempdir().unwrap();
        let iconset = work.path().join("x.iconset");
        fs::create_dir_all(&iconset).unwrap();
        for size in [16u32, 32, 128] {
            write_sample_png(&iconset.join(format!("icon_{0}x{0}.png", size)), size, size);
        }
        // A size the ICNS format has no slot for is skipped
        write_sample_png(&iconset.join("icon_300x300.png"), 300, 300);

        let output = work.path().join("out.icns");
        write_icns_fallback(&iconset, &output).unwrap();

        let family = icns::IconFamily::read(File::open(&output).unwrap()).unwrap();
        assert!(family.available_icons().len() >= 3);
    }

    #[test]
    fn test_icns_from_non_square_png() {
        let work = tempfile::tempdir().unwrap();
        let input = work.path().join("wide.png");
        let output = work.path().join("out.icns");
        write_sample_png(&input, 160, 128);

        let mut messages = Vec::new();
        {
            let mut record = |p: crate::progress::Progress| messages.push(p);
            let mut reporter = Reporter::new(&mut record);
            convert_image(&input, &output, ImageTarget::Icns, 16, None, &mut reporter).unwrap();
        }
        assert!(output.exists());

        // The iconset scratch dir is gone again
        let leftovers = fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(ICNS_SCRATCH_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
        assert!(messages.iter().any(|p| matches!(
            p,
            crate::progress::Progress::Step { message, .. } if message.contains("Cropping to square")
        )));
    }

    #[test]
    fn test_missing_input() {
        let work = tempfile::tempdir().unwrap();
        let result = convert_image(
            &work.path().join("nope.png"),
            &work.path().join("out.png"),
            ImageTarget::Png,
            16,
            None,
            &mut Reporter::silent(),
        );
        assert!(matches!(result, Err(ConvertError::InputNotFound(_))));
    }

    #[test]
    fn test_invalid_size_range() {
        let work = tempfile::tempdir().unwrap();
        let input = work.path().join("in.png");
        write_sample_png(&input, 64, 64);
        let result = convert_image(
            &input,
            &work.path().join("out.icns"),
            ImageTarget::Icns,
            128,
            Some(32),
            &mut Reporter::silent(),
        );
        assert!(matches!(result, Err(ConvertError::InvalidSizeRange { .. })));
    }
}
