//! Chaining table: which actions may follow a successful action.

use super::Action;
use crate::records::FileKind;

/// Successor actions for `(action, subject file kind)`.
///
/// Total over every pair. Eligibility against current study state is
/// decided by the planner; this table only says what may follow.
pub fn successors(action: Action, kind: FileKind) -> &'static [Action] {
    use Action::*;

    match action {
        IngestCellMetadata => match kind {
            FileKind::Metadata | FileKind::AnnData => &[IngestSubsample, DifferentialExpression],
            _ => &[],
        },
        IngestCluster => match kind {
            FileKind::Cluster | FileKind::AnnData => &[IngestSubsample, DifferentialExpression],
            _ => &[],
        },
        IngestExpression => match kind {
            FileKind::ExpressionMatrix | FileKind::MmCoordinateMatrix | FileKind::AnnData => {
                &[DifferentialExpression]
            }
            _ => &[],
        },
        IngestAnnData => match kind {
            FileKind::AnnData => &[IngestCluster, IngestCellMetadata, IngestExpression],
            _ => &[],
        },
        RenderExpressionArrays => match kind {
            FileKind::Cluster | FileKind::AnnData => &[ImagePipeline],
            _ => &[],
        },
        IngestDifferentialExpression | IngestSubsample | DifferentialExpression | ImagePipeline => {
            &[]
        }
    }
}
