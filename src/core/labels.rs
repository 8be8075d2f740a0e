use crate::core::error::InsertError;
use crate::core::models::LabelSet;

pub const LABEL_DELIMITER: char = ';';

pub fn encode_labels(labels: &LabelSet) -> Result<String, InsertError> {
    for label in labels {
        if label.is_empty() {
            return Err(InsertError::Serialization("empty label id".into()));
        }
        if label.contains(LABEL_DELIMITER) {
            return Err(InsertError::Serialization(format!(
                "label id {label:?} contains '{LABEL_DELIMITER}'"
            )));
        }
    }
    let mut out = String::with_capacity(labels.iter().map(|l| l.len() + 1).sum());
    for (i, label) in labels.iter().enumerate() {
        if i > 0 {
            out.push(LABEL_DELIMITER);
        }
        out.push_str(label);
    }
    Ok(out)
}

pub fn decode_labels(raw: &str) -> LabelSet {
    raw.split(LABEL_DELIMITER)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
