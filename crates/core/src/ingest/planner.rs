//! Job specs for requests and follow-up requests after success.
//!
//! Both halves are pure: [`ActionPlanner::job_spec`] only reads the request
//! and study, and [`ActionPlanner::chain_for`] only reads a
//! [`StudySnapshot`]. Side effects such as claiming a cluster for
//! subsampling belong to the orchestrator.

use std::collections::BTreeMap;

use thiserror::Error;

use super::chain::successors;
use super::params::{
    AnnDataParams, CellMetadataParams, ClusterParams, DifferentialExpressionParams,
    ExpressionParams, Extraction, ImagePipelineParams, JobParams, MatrixInput, MatrixType,
    SubsampleParams,
};
use super::{Action, IngestRequest, ParameterSet, ValidationError};
use crate::gateway::JobSpec;
use crate::records::{
    Annotation, AnnotationKind, AnnotationScope, ClusterGroup, FileKind, Study, StudyFile,
    StudySnapshot,
};
use crate::sizing::{MachineCatalog, ResourceSizer, SizingError};

/// Prefix for intermediate files written by AnnData extraction.
const ANNDATA_FRAGMENT_DIR: &str = "_scp_internal/anndata_ingest";

/// Prefix for image pipeline data caches.
const SCATTER_CACHE_DIR: &str = "_scp_internal/cache/expression_scatter/data";

/// Embedding extracted when an AnnData upload names none.
const DEFAULT_OBSM_KEY: &str = "X_umap";

/// Kubernetes-style label values: lowercase, 63 chars.
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
    #[error("sizing failed: {0}")]
    Sizing(#[from] SizingError),

    #[error("invalid parameters: {0}")]
    Validation(#[from] ValidationError),

    #[error("no ingest action for {0} files")]
    Unsupported(FileKind),
}

/// Settings the planner needs beyond sizing.
#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub image: String,
    /// Image for the scatter plot renderer. Falls back to `image`.
    pub image_pipeline_image: Option<String>,
    pub database_name: String,
    pub project_id: String,
    pub subsample_threshold: u64,
    pub max_de_groups: usize,
}

/// A follow-up request before it has an id or timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRequest {
    pub study_id: String,
    pub file_id: String,
    pub user_email: String,
    pub params: ParameterSet,
}

impl PlannedRequest {
    pub fn action(&self) -> Action {
        self.params.action()
    }

    pub fn into_request(self) -> IngestRequest {
        IngestRequest::new(self.study_id, self.file_id, self.user_email, self.params)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainIntent {
    Launch(PlannedRequest),
    /// Launch only after claiming the cluster's subsampling flag.
    Subsample {
        cluster_id: String,
        request: PlannedRequest,
    },
}

impl ChainIntent {
    pub fn request(&self) -> &PlannedRequest {
        match self {
            ChainIntent::Launch(request) => request,
            ChainIntent::Subsample { request, .. } => request,
        }
    }
}

/// Follow-ups for one successful request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainPlan {
    pub intents: Vec<ChainIntent>,
    /// Eligible follow-ups whose parameters could not be built.
    pub rejected: Vec<(Action, PlanError)>,
}

impl ChainPlan {
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty() && self.rejected.is_empty()
    }

    fn push(&mut self, action: Action, planned: Result<ChainIntent, PlanError>) {
        match planned {
            Ok(intent) => self.intents.push(intent),
            Err(e) => self.rejected.push((action, e)),
        }
    }
}

pub struct ActionPlanner {
    sizer: ResourceSizer,
    settings: PlannerSettings,
}

impl ActionPlanner {
    pub fn new(sizer: ResourceSizer, settings: PlannerSettings) -> Self {
        Self { sizer, settings }
    }

    pub fn catalog(&self) -> &MachineCatalog {
        self.sizer.catalog()
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    /// Build the container job for `request`.
    pub fn job_spec(&self, request: &IngestRequest, study: &Study) -> Result<JobSpec, ValidationError> {
        let resources = self
            .catalog()
            .get(request.machine_type())
            .cloned()
            .ok_or_else(|| ValidationError::MachineTypeNotAllowed(request.machine_type().to_string()))?;

        let args = request.params.params().pipeline_args();
        let (image, command) = match request.action() {
            Action::ImagePipeline => {
                // the renderer takes named flags, not a subcommand
                let cores = resources.core_count.saturating_sub(1).max(1);
                let mut command = vec![
                    "node".to_string(),
                    "expression-scatter-plots.js".to_string(),
                    "--accession".to_string(),
                    study.accession.clone(),
                    "--cores".to_string(),
                    cores.to_string(),
                ];
                command.extend(args.into_iter().skip(1));
                let image = self
                    .settings
                    .image_pipeline_image
                    .clone()
                    .unwrap_or_else(|| self.settings.image.clone());
                (image, command)
            }
            _ => {
                let mut command = vec![
                    "python".to_string(),
                    "ingest_pipeline.py".to_string(),
                    "--study-id".to_string(),
                    study.id.clone(),
                    "--study-file-id".to_string(),
                    request.file_id.clone(),
                ];
                command.extend(args);
                (self.settings.image.clone(), command)
            }
        };

        let mut labels = BTreeMap::new();
        labels.insert("study_id".to_string(), label_value(&request.study_id));
        labels.insert("study_file_id".to_string(), label_value(&request.file_id));
        labels.insert("action".to_string(), label_value(request.action().as_str()));
        labels.insert("attempt".to_string(), request.attempt.to_string());

        let mut env = BTreeMap::new();
        env.insert("DATABASE_NAME".to_string(), self.settings.database_name.clone());
        env.insert("GOOGLE_PROJECT_ID".to_string(), self.settings.project_id.clone());

        Ok(JobSpec {
            command,
            image,
            resources,
            env,
            labels,
        })
    }

    /// Primary ingest request for a freshly uploaded file.
    pub fn request_for_upload(
        &self,
        study: &Study,
        file: &StudyFile,
        user_email: &str,
    ) -> Result<IngestRequest, PlanError> {
        let action = match file.kind {
            FileKind::ExpressionMatrix | FileKind::MmCoordinateMatrix => Action::IngestExpression,
            FileKind::Cluster => Action::IngestCluster,
            FileKind::Metadata => Action::IngestCellMetadata,
            FileKind::AnnData => Action::IngestAnnData,
            FileKind::DifferentialExpression | FileKind::Other => {
                return Err(PlanError::Unsupported(file.kind))
            }
        };
        let machine_type = self.sizer.size_for(action, file.size_bytes)?.machine_type;

        let params = match action {
            Action::IngestExpression => JobParams::IngestExpression(ExpressionParams {
                matrix: matrix_input(file),
                raw_counts: file.raw_counts,
                machine_type,
            }),
            Action::IngestCluster => JobParams::IngestCluster(ClusterParams {
                cluster_file: file.location.clone(),
                name: file.name.clone(),
                machine_type,
            }),
            Action::IngestCellMetadata => JobParams::IngestCellMetadata(CellMetadataParams {
                cell_metadata_file: file.location.clone(),
                study_accession: study.accession.clone(),
                machine_type,
            }),
            _ => JobParams::IngestAnnData(AnnDataParams {
                anndata_file: file.location.clone(),
                extract: vec![
                    Extraction::Cluster,
                    Extraction::Metadata,
                    Extraction::ProcessedExpression,
                ],
                obsm_keys: vec![DEFAULT_OBSM_KEY.to_string()],
                machine_type,
            }),
        };

        let params = ParameterSet::new(params, self.catalog())?;
        Ok(IngestRequest::new(&study.id, &file.id, user_email, params))
    }

    /// Follow-up requests after `request` succeeded.
    ///
    /// `runtime_ms` is the wall-clock time of the finished job.
    pub fn chain_for(
        &self,
        request: &IngestRequest,
        snapshot: &StudySnapshot,
        runtime_ms: u64,
    ) -> ChainPlan {
        let mut plan = ChainPlan::default();
        let Some(file) = snapshot.file(&request.file_id) else {
            return plan;
        };

        for &next in successors(request.action(), file.kind) {
            match next {
                Action::IngestSubsample => self.plan_subsamples(request, snapshot, &mut plan),
                Action::DifferentialExpression => {
                    self.plan_differential_expression(request, snapshot, &mut plan)
                }
                Action::IngestCluster | Action::IngestCellMetadata | Action::IngestExpression => {
                    self.plan_fragment(next, request, snapshot, file, &mut plan)
                }
                Action::ImagePipeline => {
                    let planned = self.image_pipeline(request, snapshot, runtime_ms);
                    plan.push(next, planned.map(ChainIntent::Launch));
                }
                Action::IngestAnnData
                | Action::IngestDifferentialExpression
                | Action::RenderExpressionArrays => {}
            }
        }
        plan
    }

    /// Clusters the finished request touched.
    fn affected_clusters<'a>(
        &self,
        request: &'a IngestRequest,
        snapshot: &'a StudySnapshot,
    ) -> Vec<&'a ClusterGroup> {
        match request.params.params() {
            JobParams::IngestCluster(p) => snapshot
                .clusters_for_file(&request.file_id)
                .filter(|c| c.name == p.name)
                .collect(),
            _ => snapshot.clusters.iter().collect(),
        }
    }

    /// Metadata to pair with clusters, if any has been ingested.
    fn metadata_location(&self, request: &IngestRequest, snapshot: &StudySnapshot) -> Option<String> {
        match request.params.params() {
            JobParams::IngestCellMetadata(p) => Some(p.cell_metadata_file.clone()),
            _ => snapshot.metadata_location().map(str::to_string),
        }
    }

    fn plan_subsamples(&self, request: &IngestRequest, snapshot: &StudySnapshot, plan: &mut ChainPlan) {
        let Some(metadata) = self.metadata_location(request, snapshot) else {
            return;
        };

        for cluster in self.affected_clusters(request, snapshot) {
            if cluster.points <= self.settings.subsample_threshold
                || cluster.is_subsampling
                || cluster.subsampled
            {
                continue;
            }
            let size = snapshot
                .file(&cluster.file_id)
                .map(|f| f.size_bytes)
                .unwrap_or(0);
            let planned = self
                .sizer
                .size_for(Action::IngestSubsample, size)
                .map_err(PlanError::from)
                .and_then(|spec| {
                    self.planned(
                        request,
                        &cluster.file_id,
                        JobParams::IngestSubsample(SubsampleParams {
                            cluster_file: cluster.source_location.clone(),
                            cell_metadata_file: Some(metadata.clone()),
                            name: cluster.name.clone(),
                            machine_type: spec.machine_type,
                        }),
                    )
                })
                .map(|request| ChainIntent::Subsample {
                    cluster_id: cluster.id.clone(),
                    request,
                });
            plan.push(Action::IngestSubsample, planned);
        }
    }

    fn plan_differential_expression(
        &self,
        request: &IngestRequest,
        snapshot: &StudySnapshot,
        plan: &mut ChainPlan,
    ) {
        let Some(matrix) = snapshot.parsed_raw_matrix() else {
            return;
        };
        let Some(metadata) = self.metadata_location(request, snapshot) else {
            return;
        };

        for cluster in self.affected_clusters(request, snapshot) {
            for annotation in snapshot
                .annotations
                .iter()
                .filter(|a| self.de_eligible(snapshot, cluster, a))
            {
                let planned = self
                    .sizer
                    .size_for(Action::DifferentialExpression, matrix.size_bytes)
                    .map_err(PlanError::from)
                    .and_then(|spec| {
                        self.planned(
                            request,
                            &cluster.file_id,
                            JobParams::DifferentialExpression(DifferentialExpressionParams {
                                annotation_name: annotation.name.clone(),
                                annotation_scope: annotation.scope,
                                cluster_file: cluster.source_location.clone(),
                                cluster_name: cluster.name.clone(),
                                matrix: matrix_input(matrix),
                                cell_metadata_file: metadata.clone(),
                                machine_type: spec.machine_type,
                            }),
                        )
                    })
                    .map(ChainIntent::Launch);
                plan.push(Action::DifferentialExpression, planned);
            }
        }
    }

    fn de_eligible(&self, snapshot: &StudySnapshot, cluster: &ClusterGroup, annotation: &Annotation) -> bool {
        let in_scope = match annotation.scope {
            AnnotationScope::Study => true,
            AnnotationScope::Cluster => annotation.cluster_id.as_deref() == Some(cluster.id.as_str()),
        };
        in_scope
            && annotation.kind == AnnotationKind::Group
            && (2..=self.settings.max_de_groups).contains(&annotation.values.len())
            && !snapshot.has_de_result(&cluster.id, annotation)
    }

    /// Per-extraction requests after an AnnData bundle was split.
    fn plan_fragment(
        &self,
        next: Action,
        request: &IngestRequest,
        snapshot: &StudySnapshot,
        file: &StudyFile,
        plan: &mut ChainPlan,
    ) {
        let JobParams::IngestAnnData(anndata) = request.params.params() else {
            return;
        };
        let bucket = &snapshot.study.bucket;
        let fragment =
            |name: &str| format!("gs://{}/{}/{}/h5ad_frag.{}", bucket, ANNDATA_FRAGMENT_DIR, file.id, name);

        let extraction = match next {
            Action::IngestCluster => Extraction::Cluster,
            Action::IngestCellMetadata => Extraction::Metadata,
            _ => Extraction::ProcessedExpression,
        };
        if !anndata.extract.contains(&extraction) {
            return;
        }

        let machine_type = match self.sizer.size_for(next, file.size_bytes) {
            Ok(spec) => spec.machine_type,
            Err(e) => {
                plan.rejected.push((next, e.into()));
                return;
            }
        };

        let mut params = Vec::new();
        match extraction {
            Extraction::Cluster => {
                for key in &anndata.obsm_keys {
                    params.push(JobParams::IngestCluster(ClusterParams {
                        cluster_file: fragment(&format!("cluster.{}.tsv", key)),
                        name: key.strip_prefix("X_").unwrap_or(key).to_string(),
                        machine_type: machine_type.clone(),
                    }));
                }
            }
            Extraction::Metadata => {
                params.push(JobParams::IngestCellMetadata(CellMetadataParams {
                    cell_metadata_file: fragment("metadata.tsv"),
                    study_accession: snapshot.study.accession.clone(),
                    machine_type,
                }));
            }
            Extraction::ProcessedExpression => {
                params.push(JobParams::IngestExpression(ExpressionParams {
                    matrix: MatrixInput {
                        matrix_file: fragment("matrix.processed.mtx.gz"),
                        matrix_type: MatrixType::Mtx,
                        gene_file: Some(fragment("features.processed.tsv.gz")),
                        barcode_file: Some(fragment("barcodes.processed.tsv.gz")),
                    },
                    raw_counts: false,
                    machine_type,
                }));
            }
        }

        for p in params {
            let planned = self.planned(request, &file.id, p).map(ChainIntent::Launch);
            plan.push(next, planned);
        }
    }

    fn image_pipeline(
        &self,
        request: &IngestRequest,
        snapshot: &StudySnapshot,
        runtime_ms: u64,
    ) -> Result<PlannedRequest, PlanError> {
        let cluster_name = request
            .params
            .params()
            .output_name()
            .unwrap_or_default()
            .to_string();
        let upstream = match request.params.params() {
            JobParams::ImagePipeline(p) => p.upstream_runtime_ms,
            _ => 0,
        };
        let machine_type = self.sizer.size_for(Action::ImagePipeline, 0)?.machine_type;

        self.planned(
            request,
            &request.file_id,
            JobParams::ImagePipeline(ImagePipelineParams {
                data_cache_path: format!("{}/{}", SCATTER_CACHE_DIR, cluster_name),
                cluster_name,
                bucket: snapshot.study.bucket.clone(),
                upstream_runtime_ms: upstream.saturating_add(runtime_ms),
                machine_type,
            }),
        )
    }

    fn planned(
        &self,
        parent: &IngestRequest,
        file_id: &str,
        params: JobParams,
    ) -> Result<PlannedRequest, PlanError> {
        Ok(PlannedRequest {
            study_id: parent.study_id.clone(),
            file_id: file_id.to_string(),
            user_email: parent.user_email.clone(),
            params: ParameterSet::new(params, self.catalog())?,
        })
    }
}

fn matrix_input(file: &StudyFile) -> MatrixInput {
    match file.kind {
        FileKind::MmCoordinateMatrix => MatrixInput {
            matrix_file: file.location.clone(),
            matrix_type: MatrixType::Mtx,
            gene_file: file.genes_location.clone(),
            barcode_file: file.barcodes_location.clone(),
        },
        _ => MatrixInput {
            matrix_file: file.location.clone(),
            matrix_type: MatrixType::Dense,
            gene_file: None,
            barcode_file: None,
        },
    }
}

fn label_value(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .take(MAX_LABEL_LEN)
        .collect()
}
