//! Minimal FITS writer
//!
//! Writes a single 2-D unsigned 16-bit primary HDU:
//! - 2880-byte blocks
//! - Header with 80-character keyword records
//! - Data in big-endian format with BZERO = 32768

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const BLOCK: usize = 2880;
const RECORD: usize = 80;

/// Keywords the writer emits itself
const STRUCTURAL: [&str; 8] = [
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "EXTEND", "BZERO", "BSCALE",
];

/// Header card value
#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Keyword present with no value, used for unavailable readings
    Undefined,
}

impl CardValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CardValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CardValue::Float(f) => Some(*f),
            CardValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CardValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CardValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn render(&self) -> String {
        match self {
            CardValue::Str(s) => {
                let escaped = s.replace('\'', "''");
                format!("'{:<8}'", escaped)
            }
            CardValue::Int(i) => i.to_string(),
            CardValue::Float(f) if f.is_finite() => format!("{:.10E}", f),
            CardValue::Float(_) | CardValue::Undefined => String::new(),
            CardValue::Bool(true) => "T".to_string(),
            CardValue::Bool(false) => "F".to_string(),
        }
    }
}

impl From<&str> for CardValue {
    fn from(v: &str) -> Self {
        CardValue::Str(v.to_string())
    }
}

impl From<String> for CardValue {
    fn from(v: String) -> Self {
        CardValue::Str(v)
    }
}

impl From<bool> for CardValue {
    fn from(v: bool) -> Self {
        CardValue::Bool(v)
    }
}

impl From<f64> for CardValue {
    fn from(v: f64) -> Self {
        CardValue::Float(v)
    }
}

impl From<i64> for CardValue {
    fn from(v: i64) -> Self {
        CardValue::Int(v)
    }
}

impl From<i32> for CardValue {
    fn from(v: i32) -> Self {
        CardValue::Int(v as i64)
    }
}

impl From<u32> for CardValue {
    fn from(v: u32) -> Self {
        CardValue::Int(v as i64)
    }
}

impl From<usize> for CardValue {
    fn from(v: usize) -> Self {
        CardValue::Int(v as i64)
    }
}

impl<T: Into<CardValue>> From<Option<T>> for CardValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(CardValue::Undefined)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub key: String,
    pub value: CardValue,
    pub comment: String,
}

/// Ordered header cards; setting an existing key replaces it in place
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsHeader {
    cards: Vec<Card>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<CardValue>, comment: &str) {
        let key: String = key.to_uppercase().chars().take(8).collect();
        let card = Card {
            key,
            value: value.into(),
            comment: comment.to_string(),
        };
        match self.cards.iter_mut().find(|c| c.key == card.key) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
    }

    pub fn extend(&mut self, other: FitsHeader) {
        for card in other.cards {
            self.set(&card.key, card.value, &card.comment);
        }
    }

    pub fn get(&self, key: &str) -> Option<&CardValue> {
        let key = key.to_uppercase();
        self.cards.iter().find(|c| c.key == key).map(|c| &c.value)
    }

    pub fn comment(&self, key: &str) -> Option<&str> {
        let key = key.to_uppercase();
        self.cards
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.comment.as_str())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// FITS I/O errors
#[derive(Debug, thiserror::Error)]
pub enum FitsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid FITS format: {0}")]
    InvalidFormat(String),

    #[error("Image is {width}x{height} but holds {len} pixels")]
    SizeMismatch { width: u32, height: u32, len: usize },
}

/// Write a 16-bit image with the given header cards to disk
pub fn write_fits(
    path: &Path,
    width: u32,
    height: u32,
    data: &[u16],
    header: &FitsHeader,
) -> Result<(), FitsError> {
    if width as usize * height as usize != data.len() {
        return Err(FitsError::SizeMismatch {
            width,
            height,
            len: data.len(),
        });
    }

    let mut writer = BufWriter::new(File::create(path)?);
    let mut written = 0usize;

    write_card(&mut writer, "SIMPLE", "T", "conforms to FITS standard")?;
    write_card(&mut writer, "BITPIX", "16", "")?;
    write_card(&mut writer, "NAXIS", "2", "")?;
    write_card(&mut writer, "NAXIS1", &width.to_string(), "")?;
    write_card(&mut writer, "NAXIS2", &height.to_string(), "")?;
    write_card(&mut writer, "BZERO", "32768", "unsigned 16-bit offset")?;
    write_card(&mut writer, "BSCALE", "1", "")?;
    written += 7;

    for card in header.cards() {
        if STRUCTURAL.contains(&card.key.as_str()) || card.key == "END" {
            continue;
        }
        write_card(&mut writer, &card.key, &card.value.render(), &card.comment)?;
        written += 1;
    }
    write_card(&mut writer, "END", "", "")?;
    written += 1;

    let padding = (BLOCK - (written * RECORD) % BLOCK) % BLOCK;
    writer.write_all(&vec![b' '; padding])?;

    for &pixel in data {
        let signed = (pixel as i32 - 32768) as i16;
        writer.write_all(&signed.to_be_bytes())?;
    }
    let data_size = data.len() * 2;
    let padding = (BLOCK - data_size % BLOCK) % BLOCK;
    writer.write_all(&vec![0u8; padding])?;

    writer.flush()?;
    tracing::debug!("Wrote {}x{} FITS to {}", width, height, path.display());
    Ok(())
}

/// Write a single keyword record
fn write_card<W: Write>(
    writer: &mut W,
    keyword: &str,
    value: &str,
    comment: &str,
) -> Result<(), FitsError> {
    let mut record = [b' '; RECORD];

    let keyword_bytes = keyword.as_bytes();
    let keyword_len = keyword_bytes.len().min(8);
    record[..keyword_len].copy_from_slice(&keyword_bytes[..keyword_len]);

    if keyword == "END" {
        writer.write_all(&record)?;
        return Ok(());
    }

    record[8] = b'=';
    record[9] = b' ';

    // Strings start at column 11, everything else is right-justified to column 30
    let mut text = if value.starts_with('\'') {
        value.to_string()
    } else {
        format!("{:>20}", value)
    };
    if !comment.is_empty() {
        text.push_str(" / ");
        text.push_str(comment);
    }
    let bytes = text.as_bytes();
    let len = bytes.len().min(RECORD - 10);
    record[10..10 + len].copy_from_slice(&bytes[..len]);

    writer.write_all(&record)?;
    Ok(())
}

/// Read the header cards of a FITS file (80-character records until END)
pub fn read_header(path: &Path) -> Result<FitsHeader, FitsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut header = FitsHeader::new();
    let mut buffer = [0u8; RECORD];

    loop {
        reader.read_exact(&mut buffer)?;
        let record = String::from_utf8_lossy(&buffer);
        let keyword = record[..8].trim();

        if keyword == "END" {
            return Ok(header);
        }
        if keyword.is_empty() {
            continue;
        }
        if &record[8..10] != "= " {
            return Err(FitsError::InvalidFormat(format!(
                "record without value indicator: {}",
                keyword
            )));
        }
        let (value, comment) = parse_value(&record[10..]);
        header.set(keyword, value, &comment);
    }
}

/// Parse the value field of a record into value and comment
fn parse_value(field: &str) -> (CardValue, String) {
    let trimmed = field.trim_start();

    if let Some(rest) = trimmed.strip_prefix('\'') {
        // Doubled quotes are an escaped quote
        let mut text = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    text.push('\'');
                    continue;
                }
                break;
            }
            text.push(c);
        }
        let remainder: String = chars.collect();
        let comment = remainder
            .split_once('/')
            .map(|(_, c)| c.trim().to_string())
            .unwrap_or_default();
        return (CardValue::Str(text.trim_end().to_string()), comment);
    }

    let (value_part, comment) = match trimmed.split_once('/') {
        Some((v, c)) => (v.trim(), c.trim().to_string()),
        None => (trimmed.trim(), String::new()),
    };

    let value = match value_part {
        "" => CardValue::Undefined,
        "T" => CardValue::Bool(true),
        "F" => CardValue::Bool(false),
        v => {
            if let Ok(i) = v.parse::<i64>() {
                CardValue::Int(i)
            } else if let Ok(f) = v.replace('D', "E").parse::<f64>() {
                CardValue::Float(f)
            } else {
                CardValue::Str(v.to_string())
            }
        }
    };
    (value, comment)
}

/// Calculate airmass from altitude using Pickering's formula
///
/// X = 1 / sin(h + 244/(165 + 47*h^1.1)), clamped to [1, 40]
pub fn calculate_airmass(altitude_degrees: f64) -> f64 {
    let alt = altitude_degrees.clamp(0.0, 90.0);
    if alt >= 89.9 {
        return 1.0;
    }
    if alt <= 0.0 {
        return 40.0;
    }
    let correction = 244.0 / (165.0 + 47.0 * alt.powf(1.1));
    let airmass = 1.0 / (alt + correction).to_radians().sin();
    airmass.clamp(1.0, 40.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_set_replaces_in_place() {
        let mut header = FitsHeader::new();
        header.set("frametyp", "Light", "frame type");
        header.set("EXPTIME", 10.0, "");
        header.set("FRAMETYP", "Dark", "frame type");
        assert_eq!(header.len(), 2);
        assert_eq!(header.cards()[0].key, "FRAMETYP");
        assert_eq!(header.get_str("FRAMETYP"), Some("Dark"));
    }

    #[test]
    fn test_option_maps_to_undefined() {
        let mut header = FitsHeader::new();
        header.set("CCD-TEMP", None::<f64>, "sensor temperature");
        assert_eq!(header.get("CCD-TEMP"), Some(&CardValue::Undefined));
    }

    #[test]
    fn test_write_then_read_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fts");

        let mut header = FitsHeader::new();
        header.set("OBSNAME", "Winer's Hill", "observatory name");
        header.set("OBSLAT", 31.6656, "site latitude [deg]");
        header.set("DOMECONN", true, "");
        header.set("XBINNING", 2, "");
        header.set("ROTPOS", None::<f64>, "");

        let data: Vec<u16> = (0..12).map(|i| i * 5000).collect();
        write_fits(&path, 4, 3, &data, &header).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() % BLOCK, 0);
        // first pixel 0 is stored as -32768
        assert_eq!(&bytes[BLOCK..BLOCK + 2], &(-32768i16).to_be_bytes());

        let back = read_header(&path).unwrap();
        assert_eq!(back.get_str("OBSNAME"), Some("Winer's Hill"));
        assert!((back.get_f64("OBSLAT").unwrap() - 31.6656).abs() < 1e-9);
        assert_eq!(back.comment("OBSLAT"), Some("site latitude [deg]"));
        assert_eq!(back.get_bool("DOMECONN"), Some(true));
        assert_eq!(back.get("XBINNING").and_then(|v| v.as_i64()), Some(2));
        assert_eq!(back.get("ROTPOS"), Some(&CardValue::Undefined));
        assert_eq!(back.get("BZERO").and_then(|v| v.as_i64()), Some(32768));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_fits(&dir.path().join("x.fts"), 4, 4, &[0; 3], &FitsHeader::new());
        assert!(matches!(err, Err(FitsError::SizeMismatch { .. })));
    }

    #[test]
    fn test_calculate_airmass() {
        assert_eq!(calculate_airmass(90.0), 1.0);
        assert_eq!(calculate_airmass(-5.0), 40.0);
        let am = calculate_airmass(30.0);
        assert!(am > 1.9 && am < 2.1, "airmass at 30 deg was {}", am);
    }
}
