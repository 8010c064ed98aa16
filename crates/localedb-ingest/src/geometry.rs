//! Staged geometry files to attribute/WKT rows
//!
//! Shapefiles go through `ogr2ogr`, which reprojects to NAD83 and writes a
//! WKT CSV to stdout. Pre-converted `*.csv` files with a `WKT` column are
//! read directly.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{IngestError, Result};

/// SRID all geometries are stored in
pub const TARGET_SRID: &str = "EPSG:4269";

/// One feature: its attributes and geometry
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryRow {
    pub attributes: BTreeMap<String, String>,
    pub wkt: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestedGeometry {
    pub rows: Vec<GeometryRow>,
    pub files: usize,
}

/// Converts staged geometry files into rows
#[async_trait]
pub trait GeometryIngester: Send + Sync {
    async fn ingest(&self, workspace: &Path) -> Result<IngestedGeometry>;
}

/// Files under `root` with the given extension, in path order
pub fn find_files(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// Parse a CSV whose `WKT` column holds the geometry
pub fn parse_wkt_csv<R: std::io::Read>(reader: R, source: &str) -> Result<Vec<GeometryRow>> {
    let mut csv = csv::ReaderBuilder::new().flexible(false).from_reader(reader);
    let headers = csv.headers()?.clone();
    let wkt_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("WKT"))
        .ok_or_else(|| IngestError::parse(source, "no WKT column"))?;

    let mut rows = Vec::new();
    for record in csv.records() {
        let record = record.map_err(|e| IngestError::parse(source, e))?;
        let mut attributes = BTreeMap::new();
        let mut wkt = String::new();
        for (i, (name, value)) in headers.iter().zip(record.iter()).enumerate() {
            if i == wkt_idx {
                wkt = value.to_string();
            } else {
                attributes.insert(name.to_string(), value.to_string());
            }
        }
        rows.push(GeometryRow { attributes, wkt });
    }
    Ok(rows)
}

/// Reads pre-converted WKT CSV files
#[derive(Debug, Clone, Default)]
pub struct WktCsvIngester;

#[async_trait]
impl GeometryIngester for WktCsvIngester {
    async fn ingest(&self, workspace: &Path) -> Result<IngestedGeometry> {
        let mut out = IngestedGeometry::default();
        for path in find_files(workspace, "csv") {
            let bytes = tokio::fs::read(&path).await?;
            let source = path.display().to_string();
            out.rows.extend(parse_wkt_csv(bytes.as_slice(), &source)?);
            out.files += 1;
        }
        Ok(out)
    }
}

/// Converts shapefiles with GDAL's `ogr2ogr`
#[derive(Debug, Clone)]
pub struct OgrIngester {
    program: String,
}

impl OgrIngester {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn convert(&self, shapefile: &Path) -> Result<Vec<GeometryRow>> {
        debug!(program = %self.program, file = %shapefile.display(), "Converting shapefile");
        let output = Command::new(&self.program)
            .args(["-f", "CSV", "/vsistdout/"])
            .arg(shapefile)
            .args(["-lco", "GEOMETRY=AS_WKT", "-t_srs", TARGET_SRID])
            .output()
            .await
            .map_err(|e| IngestError::Conversion(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(IngestError::Conversion(format!(
                "{} exited with {} on {}: {}",
                self.program,
                output.status,
                shapefile.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_wkt_csv(output.stdout.as_slice(), &shapefile.display().to_string())
    }
}

#[async_trait]
impl GeometryIngester for OgrIngester {
    async fn ingest(&self, workspace: &Path) -> Result<IngestedGeometry> {
        let mut out = IngestedGeometry::default();
        for shapefile in find_files(workspace, "shp") {
            let rows = self.convert(&shapefile).await?;
            info!(file = %shapefile.display(), features = rows.len(), "Converted shapefile");
            out.rows.extend(rows);
            out.files += 1;
        }
        Ok(out)
    }
}

/// Uses `ogr2ogr` when the workspace holds shapefiles, WKT CSV otherwise
#[derive(Debug, Clone)]
pub struct AutoIngester {
    ogr: OgrIngester,
    csv: WktCsvIngester,
}

impl AutoIngester {
    pub fn new(ogr2ogr: impl Into<String>) -> Self {
        Self {
            ogr: OgrIngester::new(ogr2ogr),
            csv: WktCsvIngester,
        }
    }
}

#[async_trait]
impl GeometryIngester for AutoIngester {
    async fn ingest(&self, workspace: &Path) -> Result<IngestedGeometry> {
        if find_files(workspace, "shp").is_empty() {
            self.csv.ingest(workspace).await
        } else {
            self.ogr.ingest(workspace).await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_wkt_csv_splits_geometry_from_attributes() {
        let data = "WKT,GEOID10,NAME10\n\"MULTIPOLYGON (((0 0,1 0,1 1,0 0)))\",02,Alaska\n";
        let rows = parse_wkt_csv(data.as_bytes(), "st.csv").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].wkt.starts_with("MULTIPOLYGON"));
        assert_eq!(rows[0].attributes["GEOID10"], "02");
        assert!(!rows[0].attributes.contains_key("WKT"));
    }

    #[test]
    fn test_parse_wkt_csv_requires_wkt_column() {
        let err = parse_wkt_csv("GEOID\n02\n".as_bytes(), "x.csv").unwrap_err();
        assert!(matches!(err, IngestError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_wkt_csv_ingester_walks_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.csv"), "WKT,GEOID\n\"POINT (0 0)\",01\n").unwrap();
        std::fs::write(dir.path().join("nested/b.CSV"), "wkt,GEOID\n\"POINT (1 1)\",02\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let out = WktCsvIngester.ingest(dir.path()).await.unwrap();
        assert_eq!(out.files, 2);
        assert_eq!(out.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_converter_is_conversion_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tl.shp"), "not a shapefile").unwrap();
        let ingester = AutoIngester::new("/nonexistent/ogr2ogr");
        let err = ingester.ingest(dir.path()).await.unwrap_err();
        assert!(matches!(err, IngestError::Conversion(_)));
    }
}
