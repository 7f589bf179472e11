use strsim::generic_levenshtein;

use crate::TrainingError;

/// Total Levenshtein distance between paired token sequences. Tokens are
/// compared as atomic ids, never as characters of a rendered string.
pub fn edit_distance(
    references: &[Vec<u32>],
    hypotheses: &[Vec<u32>],
) -> Result<usize, TrainingError> {
    if references.len() != hypotheses.len() {
        return Err(TrainingError::ArityMismatch {
            references: references.len(),
            hypotheses: hypotheses.len(),
        });
    }
    Ok(references
        .iter()
        .zip(hypotheses)
        .map(|(reference, hypothesis)| generic_levenshtein(reference, hypothesis))
        .sum())
}

/// Number of reference tokens, the denominator of an error rate.
pub fn reference_length(references: &[Vec<u32>]) -> usize {
    references.iter().map(Vec::len).sum()
}
