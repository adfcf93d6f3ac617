use hashbrown::HashSet;
use http::{StatusCode, header::CONTENT_LENGTH};
use proxy_backend::Response;
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

const EMPTY_RESULT: &str = r#"{"results":[{"statement_id":0}]}"#;

fn first_series_values(info: &Value) -> Option<&Vec<Value>> {
    info.get("results")?
        .get(0)?
        .get("series")?
        .get(0)?
        .get("values")?
        .as_array()
}

fn first_series_values_mut(info: &mut Value) -> Option<&mut Value> {
    info.get_mut("results")?
        .get_mut(0)?
        .get_mut("series")?
        .get_mut(0)?
        .get_mut("values")
}

fn row_key(row: &Value) -> String {
    let cell = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match row {
        Value::Array(cells) => cells.iter().map(cell).collect::<Vec<_>>().join(","),
        other => cell(other),
    }
}

/// Combine the answers of several tag shards to one `show` statement
///
/// Only the first series of the first result carries data. Its rows are merged across all
/// responses without duplicates, into the first response that had any rows.
pub(crate) fn merge_infos(mut responses: Vec<Response>) -> Result<Response> {
    let mut seen = HashSet::new();
    let mut rows = vec![];
    let mut template = None;

    for (index, response) in responses.iter().enumerate() {
        let info: Value =
            serde_json::from_slice(&response.body).map_err(|source| Error::InvalidQueryInfo {
                body: response.body_str().into_owned(),
                source,
            })?;
        let mut has_rows = false;
        for row in first_series_values(&info).into_iter().flatten() {
            if seen.insert(row_key(row)) {
                rows.push(row.clone());
                has_rows = true;
            }
        }
        if template.is_none() && has_rows {
            template = Some((index, info));
        }
    }

    let Some((index, mut info)) = template else {
        debug!("no shard returned any rows");
        return Ok(responses
            .into_iter()
            .next()
            .unwrap_or_else(|| Response::new(StatusCode::OK, EMPTY_RESULT)));
    };
    if let Some(values) = first_series_values_mut(&mut info) {
        *values = Value::Array(rows);
    }

    let mut response = responses.swap_remove(index);
    response.body = serde_json::to_vec(&info)
        .map_err(|source| Error::InvalidQueryInfo {
            body: String::new(),
            source,
        })?
        .into();
    response.headers.remove(CONTENT_LENGTH);
    Ok(response)
}
