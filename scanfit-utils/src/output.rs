//! Writers for pipeline artifacts: ROI crops, tables and JSON summaries.
//!
//! ROI crops are written as grayscale PNG. When provenance is supplied (the
//! alignment offset and status of a crop) it is embedded as a `tEXt` chunk
//! right after `IHDR` so the crop stays traceable to its source scan.

use anyhow::{Context, Result};
use crc32fast::Hasher as Crc32;
use image::{
    ExtendedColorType, GrayImage, ImageEncoder,
    codecs::png::{CompressionType, FilterType, PngEncoder},
};
use log::{debug, warn};
use serde::Serialize;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

/// `tEXt` keyword used for embedded provenance.
pub const PNG_TEXT_KEYWORD: &str = "scanfit";

/// Create the parent directory of `path` when it is missing.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && !p.exists())
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Save a grayscale image as PNG, optionally embedding a JSON provenance record.
pub fn save_gray_png<T: Serialize>(
    image: &GrayImage,
    destination: &Path,
    provenance: Option<&T>,
) -> Result<()> {
    ensure_parent_dir(destination)?;
    debug!("Saving crop to {}", destination.display());

    let mut encoded = Vec::new();
    PngEncoder::new_with_quality(&mut encoded, CompressionType::Default, FilterType::Adaptive)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::L8,
        )
        .context("failed to encode PNG")?;

    if let Some(record) = provenance {
        let json = serde_json::to_string(record).context("failed to serialize provenance")?;
        encoded = inject_png_text(encoded, PNG_TEXT_KEYWORD, &json);
    }

    write_bytes(destination, &encoded)
}

/// Read back the provenance JSON embedded by [`save_gray_png`], if any.
pub fn read_png_text(path: &Path, keyword: &str) -> Result<Option<String>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.len() < 8 || &bytes[..8] != b"\x89PNG\r\n\x1a\n" {
        return Ok(None);
    }
    let mut cursor = 8usize;
    while cursor + 8 <= bytes.len() {
        let length = u32::from_be_bytes([
            bytes[cursor],
            bytes[cursor + 1],
            bytes[cursor + 2],
            bytes[cursor + 3],
        ]) as usize;
        let chunk_type = &bytes[cursor + 4..cursor + 8];
        let data_start = cursor + 8;
        let data_end = data_start.saturating_add(length);
        if data_end + 4 > bytes.len() {
            break;
        }
        if chunk_type == b"tEXt" {
            let data = &bytes[data_start..data_end];
            if let Some(split) = data.iter().position(|b| *b == 0)
                && &data[..split] == keyword.as_bytes()
            {
                return Ok(Some(String::from_utf8_lossy(&data[split + 1..]).into_owned()));
            }
        }
        if chunk_type == b"IEND" {
            break;
        }
        cursor = data_end + 4;
    }
    Ok(None)
}

/// Serialize `rows` to a CSV file with a header row derived from the field names.
pub fn write_csv<T: Serialize>(rows: &[T], destination: &Path) -> Result<()> {
    ensure_parent_dir(destination)?;
    let mut writer = csv::Writer::from_path(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("failed to write row to {}", destination.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", destination.display()))?;
    Ok(())
}

/// Write pretty-printed JSON.
pub fn write_json<T: Serialize + ?Sized>(value: &T, destination: &Path) -> Result<()> {
    ensure_parent_dir(destination)?;
    let file = File::create(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("failed to write JSON to {}", destination.display()))?;
    Ok(())
}

fn inject_png_text(encoded: Vec<u8>, keyword: &str, value: &str) -> Vec<u8> {
    // signature (8) + IHDR chunk (4 len + 4 type + 13 data + 4 crc)
    const IHDR_END: usize = 8 + 25;
    if encoded.len() < IHDR_END || &encoded[12..16] != b"IHDR" {
        return encoded;
    }
    let Some(chunk) = build_png_text_chunk(keyword, value) else {
        return encoded;
    };
    let mut output = Vec::with_capacity(encoded.len() + chunk.len());
    output.extend_from_slice(&encoded[..IHDR_END]);
    output.extend_from_slice(&chunk);
    output.extend_from_slice(&encoded[IHDR_END..]);
    output
}

fn build_png_text_chunk(keyword: &str, value: &str) -> Option<Vec<u8>> {
    if keyword.is_empty()
        || keyword.len() > 79
        || !keyword.chars().all(|c| c.is_ascii_graphic() || c == ' ')
    {
        warn!("PNG text keyword '{keyword}' is invalid; skipping");
        return None;
    }

    let mut data = Vec::with_capacity(keyword.len() + value.len() + 1);
    data.extend_from_slice(keyword.as_bytes());
    data.push(0);
    data.extend_from_slice(value.as_bytes());

    let mut chunk = Vec::with_capacity(12 + data.len());
    chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
    chunk.extend_from_slice(b"tEXt");
    chunk.extend_from_slice(&data);

    let mut hasher = Crc32::new();
    hasher.update(b"tEXt");
    hasher.update(&data);
    chunk.extend_from_slice(&hasher.finalize().to_be_bytes());
    Some(chunk)
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Provenance {
        dx: i32,
        dy: i32,
    }

    #[test]
    fn png_with_provenance_decodes_and_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/crop.png");
        let image = GrayImage::from_fn(5, 4, |x, y| Luma([(x * 10 + y) as u8]));
        let record = Provenance { dx: -3, dy: 7 };
        save_gray_png(&image, &path, Some(&record)).unwrap();

        let decoded = image::open(&path).unwrap().to_luma8();
        assert_eq!(decoded, image);

        let text = read_png_text(&path, PNG_TEXT_KEYWORD).unwrap().expect("chunk");
        let parsed: Provenance = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn png_without_provenance_has_no_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.png");
        save_gray_png::<Provenance>(&GrayImage::new(2, 2), &path, None).unwrap();
        assert_eq!(read_png_text(&path, PNG_TEXT_KEYWORD).unwrap(), None);
    }

    #[test]
    fn csv_writer_emits_header_and_rows() {
        #[derive(Serialize)]
        struct Row<'a> {
            model: &'a str,
            mae: f64,
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.csv");
        write_csv(&[Row { model: "A", mae: 1.5 }, Row { model: "B", mae: 0.25 }], &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "model,mae\nA,1.5\nB,0.25\n");
    }

    #[test]
    fn invalid_keyword_is_rejected() {
        assert!(build_png_text_chunk("", "x").is_none());
        assert!(build_png_text_chunk("bad\nkey", "x").is_none());
        assert!(build_png_text_chunk("scanfit", "x").is_some());
    }
}
