use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;
use ndarray::Array2;

use crate::pipeline::FeatureVector;

/// Writes the aligned matrix with the two-row header the downstream tools
/// expect: sensor group labels, then `X,Y,Z,Time/ms` repeated per block.
pub fn write_aligned_csv(path: &Path, matrix: &Array2<f64>, sensor_count: usize) -> Result<()> {
    if matrix.ncols() != sensor_count * 4 {
        bail!(
            "matrix has {} columns, expected {} for {sensor_count} sensors",
            matrix.ncols(),
            sensor_count * 4
        );
    }
    ensure_parent(path)?;
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    // Group row: each sensor label followed by three blank cells, except
    // after the last block.
    let mut groups: Vec<String> = Vec::new();
    for id in 1..=sensor_count {
        groups.push(format!("Sensor {id}"));
        if id != sensor_count {
            groups.extend([" ", " ", " "].map(String::from));
        }
    }
    writeln!(writer, "{}", groups.join(","))?;
    let axes = vec!["X,Y,Z,Time/ms"; sensor_count];
    writeln!(writer, "{}", axes.join(","))?;

    for row in matrix.rows() {
        let fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(writer, "{}", fields.join(","))?;
    }
    writer.flush()?;
    info!("saved {} rows to {}", matrix.nrows(), path.display());
    Ok(())
}

/// Reads an aligned-matrix export back: skips the two header rows, parses
/// the rest as f64.
pub fn read_aligned_csv(path: &Path) -> Result<Array2<f64>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if index < 2 || line.trim().is_empty() {
            continue;
        }
        let row: Vec<f64> = line
            .split(',')
            .map(|field| {
                field.trim().parse::<f64>().with_context(|| {
                    format!("non-numeric field {field:?} at line {}", index + 1)
                })
            })
            .collect::<Result<_>>()?;
        rows.push(row);
    }
    if rows.is_empty() {
        bail!("{} holds no data rows", path.display());
    }
    let cols = rows[0].len();
    if rows.iter().any(|row| row.len() != cols) {
        bail!("{} has ragged rows", path.display());
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let matrix = Array2::from_shape_vec((flat.len() / cols, cols), flat)?;
    Ok(matrix)
}

/// Writes the training-ready feature table: header `x0..xK,y`, one row per
/// instance, the label last.
pub fn write_feature_csv(path: &Path, vectors: &[FeatureVector]) -> Result<()> {
    let Some(first) = vectors.first() else {
        bail!("no feature vectors to save");
    };
    if first.is_empty() {
        bail!("feature vectors hold no spectrum bins");
    }
    if vectors.iter().any(|v| v.len() != first.len()) {
        bail!("feature vectors have inconsistent lengths");
    }
    ensure_parent(path)?;
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let mut header: Vec<String> = (0..first.len()).map(|i| format!("x{i}")).collect();
    header.push("y".to_string());
    writeln!(writer, "{}", header.join(","))?;

    for vector in vectors {
        for value in &vector.values {
            write!(writer, "{value},")?;
        }
        writeln!(writer, "{}", vector.label)?;
    }
    writer.flush()?;
    info!(
        "saved {} feature rows of width {} to {}",
        vectors.len(),
        first.len() + 1,
        path.display()
    );
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("vibrascope_storage_test");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn aligned_matrix_round_trips() {
        let path = temp_path("aligned.csv");
        let matrix = array![
            [1.0, 2.0, 3.0, 0.0],
            [4.0, 5.0, 6.0, 60.0],
        ];
        write_aligned_csv(&path, &matrix, 1).unwrap();
        let back = read_aligned_csv(&path).unwrap();
        assert_eq!(back, matrix);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn aligned_header_matches_the_export_schema() {
        let path = temp_path("header.csv");
        let matrix = array![[1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]];
        write_aligned_csv(&path, &matrix, 2).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("Sensor 1"));
        assert_eq!(lines.next().unwrap(), "X,Y,Z,Time/ms,X,Y,Z,Time/ms");
        fs::remove_file(&path).ok();
    }

    #[test]
    fn wrong_width_matrix_is_refused() {
        let path = temp_path("bad.csv");
        let matrix = array![[1.0, 2.0, 3.0]];
        assert!(write_aligned_csv(&path, &matrix, 1).is_err());
    }

    #[test]
    fn feature_table_has_indexed_header_and_trailing_label() {
        let path = temp_path("features.csv");
        let vectors = vec![
            FeatureVector {
                values: vec![1.5, 2.5],
                label: 1,
            },
            FeatureVector {
                values: vec![3.5, 4.5],
                label: 0,
            },
        ];
        write_feature_csv(&path, &vectors).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "x0,x1,y");
        assert_eq!(lines[1], "1.5,2.5,1");
        assert_eq!(lines[2], "3.5,4.5,0");
        fs::remove_file(&path).ok();
    }

    #[test]
    fn empty_feature_table_is_refused() {
        let path = temp_path("empty.csv");
        assert!(write_feature_csv(&path, &[]).is_err());
    }
}
