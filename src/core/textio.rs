use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use nalgebra::DMatrix;

use crate::error::ModelError;

/// Read a whitespace-separated numeric matrix, one row per line.
/// Blank lines and lines starting with `#` are skipped.
pub fn read_matrix(path: &Path) -> Result<DMatrix<f64>, ModelError> {
    let text = fs::read_to_string(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_matrix(&text, path)
}

pub(crate) fn parse_matrix(text: &str, path: &Path) -> Result<DMatrix<f64>, ModelError> {
    let mut values: Vec<f64> = Vec::new();
    let mut cols: Option<usize> = None;
    let mut rows = 0usize;

    for (lineno, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let before = values.len();
        for tok in trimmed.split_whitespace() {
            let v = tok.parse::<f64>().map_err(|_| ModelError::Parse {
                path: path.to_path_buf(),
                line: lineno + 1,
                reason: format!("not a number: {tok:?}"),
            })?;
            values.push(v);
        }
        let n = values.len() - before;
        match cols {
            None => cols = Some(n),
            Some(c) if c != n => {
                return Err(ModelError::Parse {
                    path: path.to_path_buf(),
                    line: lineno + 1,
                    reason: format!("expected {c} columns, found {n}"),
                });
            }
            Some(_) => {}
        }
        rows += 1;
    }

    let cols = cols.unwrap_or(0);
    if rows == 0 {
        return Err(ModelError::Parse {
            path: path.to_path_buf(),
            line: 0,
            reason: "file contains no data".to_string(),
        });
    }
    Ok(DMatrix::from_row_slice(rows, cols, &values))
}

/// Write a matrix in the format accepted by [`read_matrix`], with an optional `#` header.
pub fn write_matrix(path: &Path, m: &DMatrix<f64>, header: Option<&str>) -> Result<(), ModelError> {
    let mut out = String::new();
    if let Some(h) = header {
        for line in h.lines() {
            let _ = writeln!(out, "# {line}");
        }
    }
    for r in 0..m.nrows() {
        let row: Vec<String> = (0..m.ncols()).map(|c| format!("{}", m[(r, c)])).collect();
        out.push_str(&row.join(" "));
        out.push('\n');
    }
    fs::write(path, out).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Drop samples that barely moved since the previous one.
///
/// Row `i` is kept when `|row(i+1) - row(i)| > dt * dist_min`; the final row is always kept so the
/// demonstration end point survives. Returns `None` when fewer than two rows remain.
pub fn crop_samples(data: &DMatrix<f64>, dt: f64, dist_min: f64) -> Option<DMatrix<f64>> {
    let n = data.nrows();
    if n < 2 {
        return None;
    }
    let min_step = dt * dist_min;
    let mut keep: Vec<usize> = Vec::with_capacity(n);
    for i in 0..n - 1 {
        if (data.row(i + 1) - data.row(i)).norm() > min_step {
            keep.push(i);
        }
    }
    if keep.is_empty() {
        return None;
    }
    let last = n - 1;
    if (data.row(last) - data.row(*keep.last()?)).norm() > min_step {
        keep.push(last);
    }
    if keep.len() < 2 {
        return None;
    }
    Some(data.select_rows(keep.iter()))
}
