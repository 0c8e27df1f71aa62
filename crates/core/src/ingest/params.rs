//! Action-specific job parameters.
//!
//! [`JobParams`] is the raw payload; [`ParameterSet`] is the validated,
//! immutable form every [`IngestRequest`](super::IngestRequest) carries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Action;
use crate::records::AnnotationScope;
use crate::sizing::MachineCatalog;
use crate::storage::RemoteLocation;

/// Longest upstream runtime an image pipeline request may carry.
const MAX_UPSTREAM_RUNTIME_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("{field} is not a valid gs:// url: {value}")]
    InvalidUrl { field: &'static str, value: String },

    #[error("machine type {0} is not allow-listed")]
    MachineTypeNotAllowed(String),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixType {
    Dense,
    Mtx,
}

impl MatrixType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatrixType::Dense => "dense",
            MatrixType::Mtx => "mtx",
        }
    }
}

/// Fragment kinds extracted from an AnnData bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extraction {
    Cluster,
    Metadata,
    ProcessedExpression,
}

impl Extraction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extraction::Cluster => "cluster",
            Extraction::Metadata => "metadata",
            Extraction::ProcessedExpression => "processed_expression",
        }
    }
}

/// Expression matrix input shared by several actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixInput {
    pub matrix_file: String,
    pub matrix_type: MatrixType,
    #[serde(default)]
    pub gene_file: Option<String>,
    #[serde(default)]
    pub barcode_file: Option<String>,
}

impl MatrixInput {
    fn validate(&self) -> Result<(), ValidationError> {
        require_url("matrix_file", &self.matrix_file)?;
        match self.matrix_type {
            MatrixType::Mtx => {
                require_url(
                    "gene_file",
                    self.gene_file
                        .as_deref()
                        .ok_or(ValidationError::MissingField { field: "gene_file" })?,
                )?;
                require_url(
                    "barcode_file",
                    self.barcode_file
                        .as_deref()
                        .ok_or(ValidationError::MissingField {
                            field: "barcode_file",
                        })?,
                )?;
            }
            MatrixType::Dense => {
                optional_url("gene_file", self.gene_file.as_deref())?;
                optional_url("barcode_file", self.barcode_file.as_deref())?;
            }
        }
        Ok(())
    }

    fn push_args(&self, args: &mut Vec<String>, matrix_flag: &str) {
        push_flag(args, matrix_flag, &self.matrix_file);
        push_flag(args, "--matrix-file-type", self.matrix_type.as_str());
        if let Some(gene_file) = &self.gene_file {
            push_flag(args, "--gene-file", gene_file);
        }
        if let Some(barcode_file) = &self.barcode_file {
            push_flag(args, "--barcode-file", barcode_file);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionParams {
    #[serde(flatten)]
    pub matrix: MatrixInput,
    #[serde(default)]
    pub raw_counts: bool,
    pub machine_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    pub cluster_file: String,
    pub name: String,
    pub machine_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellMetadataParams {
    pub cell_metadata_file: String,
    pub study_accession: String,
    pub machine_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnDataParams {
    pub anndata_file: String,
    pub extract: Vec<Extraction>,
    #[serde(default)]
    pub obsm_keys: Vec<String>,
    pub machine_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorDeParams {
    pub differential_expression_file: String,
    pub annotation_name: String,
    pub annotation_scope: AnnotationScope,
    pub cluster_name: String,
    pub machine_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsampleParams {
    pub cluster_file: String,
    #[serde(default)]
    pub cell_metadata_file: Option<String>,
    pub name: String,
    pub machine_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialExpressionParams {
    pub annotation_name: String,
    pub annotation_scope: AnnotationScope,
    pub cluster_file: String,
    pub cluster_name: String,
    #[serde(flatten)]
    pub matrix: MatrixInput,
    pub cell_metadata_file: String,
    pub machine_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderExpressionParams {
    pub cluster_file: String,
    pub cluster_name: String,
    #[serde(flatten)]
    pub matrix: MatrixInput,
    pub machine_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePipelineParams {
    pub cluster_name: String,
    pub bucket: String,
    pub data_cache_path: String,
    /// Runtime of the render job that produced this request.
    #[serde(default)]
    pub upstream_runtime_ms: u64,
    pub machine_type: String,
}

/// Raw, unvalidated parameters, one variant per action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum JobParams {
    IngestExpression(ExpressionParams),
    IngestCluster(ClusterParams),
    IngestCellMetadata(CellMetadataParams),
    #[serde(rename = "ingest_anndata")]
    IngestAnnData(AnnDataParams),
    IngestDifferentialExpression(AuthorDeParams),
    IngestSubsample(SubsampleParams),
    DifferentialExpression(DifferentialExpressionParams),
    RenderExpressionArrays(RenderExpressionParams),
    ImagePipeline(ImagePipelineParams),
}

impl JobParams {
    pub fn action(&self) -> Action {
        match self {
            JobParams::IngestExpression(_) => Action::IngestExpression,
            JobParams::IngestCluster(_) => Action::IngestCluster,
            JobParams::IngestCellMetadata(_) => Action::IngestCellMetadata,
            JobParams::IngestAnnData(_) => Action::IngestAnnData,
            JobParams::IngestDifferentialExpression(_) => Action::IngestDifferentialExpression,
            JobParams::IngestSubsample(_) => Action::IngestSubsample,
            JobParams::DifferentialExpression(_) => Action::DifferentialExpression,
            JobParams::RenderExpressionArrays(_) => Action::RenderExpressionArrays,
            JobParams::ImagePipeline(_) => Action::ImagePipeline,
        }
    }

    pub fn machine_type(&self) -> &str {
        match self {
            JobParams::IngestExpression(p) => &p.machine_type,
            JobParams::IngestCluster(p) => &p.machine_type,
            JobParams::IngestCellMetadata(p) => &p.machine_type,
            JobParams::IngestAnnData(p) => &p.machine_type,
            JobParams::IngestDifferentialExpression(p) => &p.machine_type,
            JobParams::IngestSubsample(p) => &p.machine_type,
            JobParams::DifferentialExpression(p) => &p.machine_type,
            JobParams::RenderExpressionArrays(p) => &p.machine_type,
            JobParams::ImagePipeline(p) => &p.machine_type,
        }
    }

    fn with_machine_type(mut self, machine_type: &str) -> Self {
        let slot = match &mut self {
            JobParams::IngestExpression(p) => &mut p.machine_type,
            JobParams::IngestCluster(p) => &mut p.machine_type,
            JobParams::IngestCellMetadata(p) => &mut p.machine_type,
            JobParams::IngestAnnData(p) => &mut p.machine_type,
            JobParams::IngestDifferentialExpression(p) => &mut p.machine_type,
            JobParams::IngestSubsample(p) => &mut p.machine_type,
            JobParams::DifferentialExpression(p) => &mut p.machine_type,
            JobParams::RenderExpressionArrays(p) => &mut p.machine_type,
            JobParams::ImagePipeline(p) => &mut p.machine_type,
        };
        *slot = machine_type.to_string();
        self
    }

    /// Name that narrows this request's output within its file.
    pub fn output_name(&self) -> Option<&str> {
        match self {
            JobParams::IngestCluster(p) => Some(&p.name),
            JobParams::IngestSubsample(p) => Some(&p.name),
            JobParams::IngestDifferentialExpression(p) => Some(&p.annotation_name),
            JobParams::DifferentialExpression(p) => Some(&p.annotation_name),
            JobParams::RenderExpressionArrays(p) => Some(&p.cluster_name),
            JobParams::ImagePipeline(p) => Some(&p.cluster_name),
            JobParams::IngestExpression(_)
            | JobParams::IngestCellMetadata(_)
            | JobParams::IngestAnnData(_) => None,
        }
    }

    /// Raw-counts flag of an expression ingest.
    pub fn raw_counts(&self) -> Option<bool> {
        match self {
            JobParams::IngestExpression(p) => Some(p.raw_counts),
            _ => None,
        }
    }

    fn validate(&self, catalog: &MachineCatalog) -> Result<(), ValidationError> {
        if !catalog.contains(self.machine_type()) {
            return Err(ValidationError::MachineTypeNotAllowed(
                self.machine_type().to_string(),
            ));
        }

        match self {
            JobParams::IngestExpression(p) => p.matrix.validate(),
            JobParams::IngestCluster(p) => {
                require_url("cluster_file", &p.cluster_file)?;
                require_text("name", &p.name)
            }
            JobParams::IngestCellMetadata(p) => {
                require_url("cell_metadata_file", &p.cell_metadata_file)?;
                require_text("study_accession", &p.study_accession)
            }
            JobParams::IngestAnnData(p) => {
                require_url("anndata_file", &p.anndata_file)?;
                if p.extract.is_empty() {
                    return Err(ValidationError::MissingField { field: "extract" });
                }
                if p.extract.contains(&Extraction::Cluster) && p.obsm_keys.is_empty() {
                    return Err(ValidationError::MissingField { field: "obsm_keys" });
                }
                p.obsm_keys
                    .iter()
                    .try_for_each(|key| require_text("obsm_keys", key))
            }
            JobParams::IngestDifferentialExpression(p) => {
                require_url("differential_expression_file", &p.differential_expression_file)?;
                require_text("annotation_name", &p.annotation_name)?;
                require_text("cluster_name", &p.cluster_name)
            }
            JobParams::IngestSubsample(p) => {
                require_url("cluster_file", &p.cluster_file)?;
                optional_url("cell_metadata_file", p.cell_metadata_file.as_deref())?;
                require_text("name", &p.name)
            }
            JobParams::DifferentialExpression(p) => {
                require_text("annotation_name", &p.annotation_name)?;
                require_url("cluster_file", &p.cluster_file)?;
                require_text("cluster_name", &p.cluster_name)?;
                p.matrix.validate()?;
                require_url("cell_metadata_file", &p.cell_metadata_file)
            }
            JobParams::RenderExpressionArrays(p) => {
                require_url("cluster_file", &p.cluster_file)?;
                require_text("cluster_name", &p.cluster_name)?;
                p.matrix.validate()
            }
            JobParams::ImagePipeline(p) => {
                require_text("cluster_name", &p.cluster_name)?;
                require_text("data_cache_path", &p.data_cache_path)?;
                RemoteLocation::new(p.bucket.clone(), p.data_cache_path.clone()).map_err(|_| {
                    ValidationError::InvalidUrl {
                        field: "bucket",
                        value: p.bucket.clone(),
                    }
                })?;
                if p.upstream_runtime_ms > MAX_UPSTREAM_RUNTIME_MS {
                    return Err(ValidationError::OutOfRange {
                        field: "upstream_runtime_ms",
                        value: p.upstream_runtime_ms.to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Subcommand and flags passed to the pipeline entry point.
    pub fn pipeline_args(&self) -> Vec<String> {
        let mut args = vec![self.action().as_str().to_string()];
        match self {
            JobParams::IngestExpression(p) => {
                p.matrix.push_args(&mut args, "--matrix-file");
                if p.raw_counts {
                    args.push("--raw-counts".to_string());
                }
                args.push("--ingest-expression".to_string());
            }
            JobParams::IngestCluster(p) => {
                push_flag(&mut args, "--cluster-file", &p.cluster_file);
                push_flag(&mut args, "--name", &p.name);
                args.push("--ingest-cluster".to_string());
            }
            JobParams::IngestCellMetadata(p) => {
                push_flag(&mut args, "--cell-metadata-file", &p.cell_metadata_file);
                push_flag(&mut args, "--study-accession", &p.study_accession);
                args.push("--ingest-cell-metadata".to_string());
            }
            JobParams::IngestAnnData(p) => {
                push_flag(&mut args, "--anndata-file", &p.anndata_file);
                let extract: Vec<&str> = p.extract.iter().map(|e| e.as_str()).collect();
                push_flag(&mut args, "--extract", &extract.join(","));
                if !p.obsm_keys.is_empty() {
                    push_flag(&mut args, "--obsm-keys", &p.obsm_keys.join(","));
                }
                args.push("--ingest-anndata".to_string());
            }
            JobParams::IngestDifferentialExpression(p) => {
                push_flag(
                    &mut args,
                    "--differential-expression-file",
                    &p.differential_expression_file,
                );
                push_flag(&mut args, "--annotation-name", &p.annotation_name);
                push_flag(&mut args, "--annotation-scope", p.annotation_scope.as_str());
                push_flag(&mut args, "--cluster-name", &p.cluster_name);
                args.push("--ingest-differential-expression".to_string());
            }
            JobParams::IngestSubsample(p) => {
                push_flag(&mut args, "--cluster-file", &p.cluster_file);
                if let Some(metadata) = &p.cell_metadata_file {
                    push_flag(&mut args, "--cell-metadata-file", metadata);
                }
                push_flag(&mut args, "--name", &p.name);
                args.push("--subsample".to_string());
            }
            JobParams::DifferentialExpression(p) => {
                push_flag(&mut args, "--annotation-name", &p.annotation_name);
                push_flag(&mut args, "--annotation-scope", p.annotation_scope.as_str());
                push_flag(&mut args, "--cluster-file", &p.cluster_file);
                push_flag(&mut args, "--cluster-name", &p.cluster_name);
                p.matrix.push_args(&mut args, "--matrix-file-path");
                push_flag(&mut args, "--cell-metadata-file", &p.cell_metadata_file);
                args.push("--differential-expression".to_string());
            }
            JobParams::RenderExpressionArrays(p) => {
                push_flag(&mut args, "--cluster-file", &p.cluster_file);
                push_flag(&mut args, "--cluster-name", &p.cluster_name);
                p.matrix.push_args(&mut args, "--matrix-file-path");
                args.push("--render-expression-arrays".to_string());
            }
            JobParams::ImagePipeline(p) => {
                push_flag(&mut args, "--cluster", &p.cluster_name);
                push_flag(&mut args, "--bucket", &p.bucket);
                push_flag(&mut args, "--data-cache-path", &p.data_cache_path);
            }
        }
        args
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: &str) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

fn require_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField { field })
    } else {
        Ok(())
    }
}

fn require_url(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    value
        .parse::<RemoteLocation>()
        .map(|_| ())
        .map_err(|_| ValidationError::InvalidUrl {
            field,
            value: value.to_string(),
        })
}

fn optional_url(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    value.map_or(Ok(()), |v| require_url(field, v))
}

/// Validated job parameters. Cannot be mutated after construction;
/// escalation returns a new set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobParams", into = "JobParams")]
pub struct ParameterSet {
    params: JobParams,
}

impl ParameterSet {
    pub fn new(params: JobParams, catalog: &MachineCatalog) -> Result<Self, ValidationError> {
        params.validate(catalog)?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn action(&self) -> Action {
        self.params.action()
    }

    pub fn machine_type(&self) -> &str {
        self.params.machine_type()
    }

    /// Same parameters on the next larger allow-listed tier, if one exists.
    pub fn escalated(&self, catalog: &MachineCatalog) -> Option<ParameterSet> {
        let next = catalog.next_after(self.machine_type())?;
        Some(Self {
            params: self.params.clone().with_machine_type(&next.machine_type),
        })
    }
}

impl TryFrom<JobParams> for ParameterSet {
    type Error = ValidationError;

    fn try_from(params: JobParams) -> Result<Self, Self::Error> {
        Self::new(params, &MachineCatalog::full())
    }
}

impl From<ParameterSet> for JobParams {
    fn from(set: ParameterSet) -> Self {
        set.params
    }
}
