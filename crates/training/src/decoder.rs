use std::{collections::HashMap, fs, path::Path};

use candle_core::{DType, Tensor, D};

use crate::{config::DecoderConfig, loss::BLANK, TrainingError};

/// Word sequences for a batch, each row valid up to its count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderOutput {
    pub words: Vec<Vec<u32>>,
    pub alignments: Vec<Vec<u32>>,
    pub word_counts: Vec<usize>,
    pub alignment_counts: Vec<usize>,
}

pub trait Decoder {
    /// `log_probs` is `[batch, time, classes]`; frames past `lengths[b]` are padding.
    fn decode(&self, log_probs: &Tensor, lengths: &[usize]) -> Result<DecoderOutput, TrainingError>;

    fn word_index(&self, word: &str) -> u32;

    fn word(&self, index: u32) -> Option<&str>;
}

/// Most likely class per frame, truncated to each utterance's length.
pub fn best_path(scores: &Tensor, lengths: &[usize]) -> Result<Vec<Vec<u32>>, TrainingError> {
    let (batch, time, _) = scores.dims3()?;
    if lengths.len() != batch {
        return Err(TrainingError::runtime(format!(
            "{} lengths for a batch of {batch}",
            lengths.len()
        )));
    }
    let scores = if scores.dtype() == DType::F32 {
        scores.clone()
    } else {
        scores.to_dtype(DType::F32)?
    };
    let argmax = scores.argmax(D::Minus1)?.to_vec2::<u32>()?;
    argmax
        .into_iter()
        .zip(lengths)
        .map(|(mut path, &len)| {
            if len > time {
                return Err(TrainingError::runtime(format!(
                    "length {len} exceeds {time} frames"
                )));
            }
            path.truncate(len);
            Ok(path)
        })
        .collect()
}

/// Merge consecutive repeats, then drop blanks.
pub fn collapse(path: &[u32]) -> Vec<u32> {
    let mut labels = Vec::with_capacity(path.len());
    let mut previous = None;
    for &label in path {
        if previous != Some(label) && label != BLANK {
            labels.push(label);
        }
        previous = Some(label);
    }
    labels
}

/// Greedy best-path decoding into words: collapsed label runs are split on
/// the word separator label and each run is looked up in the lexicon.
pub struct GreedyCtcDecoder {
    labels: Vec<String>,
    separator: u32,
    words: HashMap<String, u32>,
    vocabulary: Vec<String>,
    unknown: u32,
}

impl GreedyCtcDecoder {
    pub fn new(
        labels: Vec<String>,
        lexicon: Vec<String>,
        word_separator: &str,
        unknown_word: &str,
    ) -> Result<Self, TrainingError> {
        if labels.len() < 2 {
            return Err(TrainingError::initialization(
                "decoder needs the blank and at least one label",
            ));
        }
        let separator = labels
            .iter()
            .position(|label| label == word_separator)
            .ok_or_else(|| {
                TrainingError::initialization(format!(
                    "word separator '{word_separator}' is not a label"
                ))
            })? as u32;

        let mut words: HashMap<String, u32> = HashMap::with_capacity(lexicon.len() + 1);
        let mut vocabulary = Vec::with_capacity(lexicon.len() + 1);
        for word in lexicon.into_iter().chain([unknown_word.to_string()]) {
            if !words.contains_key(&word) {
                words.insert(word.clone(), vocabulary.len() as u32);
                vocabulary.push(word);
            }
        }
        let unknown = words[unknown_word];

        Ok(Self {
            labels,
            separator,
            words,
            vocabulary,
            unknown,
        })
    }

    pub fn from_config(config: &DecoderConfig) -> Result<Self, TrainingError> {
        Self::new(
            read_lines(&config.labels)?,
            read_lines(&config.lexicon)?,
            &config.word_separator,
            &config.unknown_word,
        )
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    fn spell(&self, labels: &[u32]) -> String {
        labels
            .iter()
            .filter_map(|&label| self.labels.get(label as usize))
            .map(String::as_str)
            .collect()
    }
}

impl Decoder for GreedyCtcDecoder {
    fn decode(&self, log_probs: &Tensor, lengths: &[usize]) -> Result<DecoderOutput, TrainingError> {
        let mut output = DecoderOutput::default();
        for path in best_path(log_probs, lengths)? {
            let labels = collapse(&path);
            let words: Vec<u32> = labels
                .split(|&label| label == self.separator)
                .filter(|run| !run.is_empty())
                .map(|run| self.word_index(&self.spell(run)))
                .collect();
            output.word_counts.push(words.len());
            output.alignment_counts.push(path.len());
            output.words.push(words);
            output.alignments.push(path);
        }
        Ok(output)
    }

    fn word_index(&self, word: &str) -> u32 {
        self.words.get(word).copied().unwrap_or(self.unknown)
    }

    fn word(&self, index: u32) -> Option<&str> {
        self.vocabulary.get(index as usize).map(String::as_str)
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>, TrainingError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        TrainingError::initialization(format!("failed to read {}: {err}", path.display()))
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn decoder() -> GreedyCtcDecoder {
        let labels = ["<blank>", "|", "a", "b"].map(String::from).to_vec();
        let lexicon = ["ab", "ba"].map(String::from).to_vec();
        GreedyCtcDecoder::new(labels, lexicon, "|", "<unk>").unwrap()
    }

    fn one_hot(path: &[u32], classes: usize) -> Tensor {
        let mut data = vec![0f32; path.len() * classes];
        for (t, &label) in path.iter().enumerate() {
            data[t * classes + label as usize] = 1.0;
        }
        Tensor::from_vec(data, (1, path.len(), classes), &Device::Cpu).unwrap()
    }

    #[test]
    fn collapses_repeats_then_blanks() {
        assert_eq!(collapse(&[0, 2, 2, 0, 2, 3, 3, 0]), vec![2, 2, 3]);
        assert!(collapse(&[0, 0]).is_empty());
    }

    #[test]
    fn splits_words_on_separator() {
        let decoder = decoder();
        let path = [2, 2, 3, 1, 3, 0, 2, 1, 3, 3];
        let output = decoder.decode(&one_hot(&path, 4), &[path.len()]).unwrap();
        // "ab", "ba", then "b" which is not in the lexicon
        assert_eq!(output.words, vec![vec![0, 1, 2]]);
        assert_eq!(output.word_counts, vec![3]);
        assert_eq!(output.alignment_counts, vec![10]);
    }

    #[test]
    fn ignores_padding_frames() {
        let decoder = decoder();
        let output = decoder.decode(&one_hot(&[2, 3, 1, 3], 4), &[2]).unwrap();
        assert_eq!(output.words, vec![vec![decoder.word_index("ab")]]);
    }

    #[test]
    fn unknown_words_share_an_index() {
        let decoder = decoder();
        assert_eq!(decoder.word_index("zz"), decoder.word_index("<unk>"));
        assert_ne!(decoder.word_index("ab"), decoder.word_index("zz"));
        assert_eq!(decoder.word(decoder.word_index("ba")), Some("ba"));
        assert_eq!(decoder.word(99), None);
    }
}
