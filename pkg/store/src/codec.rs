//! Line-level encoding shared by the snapshot and the write-ahead log.
//!
//! Every persisted line is tab-separated UTF-8. Free-text fields are escaped
//! so a raw tab or newline never appears inside a field, floats use Rust's
//! shortest round-trip formatting so values decode bit-for-bit.

use schema::Record;

pub(crate) fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// `<tag>\t1\t<generation>\t<crc of generation>`; the checksum keeps a
/// flipped digit from silently moving a file into another generation.
pub(crate) fn generation_line(tag: &str, generation: u64) -> String {
    let value = generation.to_string();
    format!(
        "{tag}\t{FORMAT_VERSION}\t{value}\t{:08x}\n",
        checksum(value.as_bytes())
    )
}

pub(crate) fn parse_generation_line(tag: &str, line: &str) -> Result<u64, String> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() != 4 || parts[0] != tag {
        return Err(format!("expected {tag} header"));
    }
    if parts[1] != FORMAT_VERSION {
        return Err(format!("unsupported {tag} version {}", parts[1]));
    }
    let expected = parse_checksum(parts[3])?;
    if checksum(parts[2].as_bytes()) != expected {
        return Err(format!("{tag} header checksum mismatch"));
    }
    parts[2]
        .parse::<u64>()
        .map_err(|_| format!("{tag} header has invalid generation"))
}

pub(crate) const FORMAT_VERSION: &str = "1";

pub(crate) fn parse_checksum(raw: &str) -> Result<u32, String> {
    if raw.len() != 8 {
        return Err("checksum field must be 8 hex digits".to_string());
    }
    u32::from_str_radix(raw, 16).map_err(|_| "checksum field is not hex".to_string())
}

/// `task_id \t reward \t timestamp \t embedding`
pub(crate) fn record_to_fields(record: &Record) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        escape_field(&record.task_id),
        record.reward,
        record.timestamp,
        pack_f32_list(&record.embedding)
    )
}

pub(crate) fn fields_to_record(parts: &[&str]) -> Result<Record, String> {
    if parts.len() != 4 {
        return Err(format!(
            "record has {} fields, expected 4",
            parts.len()
        ));
    }
    let reward = parts[1]
        .parse::<f32>()
        .map_err(|_| "record has invalid reward".to_string())?;
    let timestamp = parts[2]
        .parse::<i64>()
        .map_err(|_| "record has invalid timestamp".to_string())?;
    Ok(Record {
        task_id: unescape_field(parts[0])?,
        embedding: unpack_f32_list(parts[3])?,
        reward,
        timestamp,
    })
}

pub(crate) fn escape_field(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

pub(crate) fn unescape_field(value: &str) -> Result<String, String> {
    let mut output = String::with_capacity(value.len());
    let mut escaped = false;
    for ch in value.chars() {
        if escaped {
            match ch {
                '\\' => output.push('\\'),
                't' => output.push('\t'),
                'n' => output.push('\n'),
                'r' => output.push('\r'),
                other => return Err(format!("invalid escape sequence: \\{other}")),
            }
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            output.push(ch);
        }
    }
    if escaped {
        return Err("unterminated escape sequence".to_string());
    }
    Ok(output)
}

pub(crate) fn pack_f32_list(values: &[f32]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn unpack_f32_list(raw: &str) -> Result<Vec<f32>, String> {
    if raw.trim().is_empty() {
        return Err("embedding cannot be empty".to_string());
    }
    let mut values = Vec::new();
    for part in raw.split(',') {
        let parsed = part
            .parse::<f32>()
            .map_err(|_| format!("invalid embedding value '{part}'"))?;
        values.push(parsed);
    }
    Ok(values)
}
