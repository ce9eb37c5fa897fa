//! C9 Audio Merger (§4.9).
//!
//! Grounded on the teacher's `utils::audio::{merge_binary_files,
//! merge_wav_files}`, which concatenate on-disk files by raw bytes or by
//! parsing WAV headers and stitching `data` chunks. The core works on
//! in-memory [`crate::tts::AudioFragment`] bytes rather than paths (TTS
//! fragments never touch disk before merge), so the same chunk-parsing
//! logic is reworked to operate on byte slices and only the final merged
//! buffer is written out, through [`crate::storage::Storage`].

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

use crate::storage::Storage;
use crate::tts::AudioFragment;

/// Maps destination filenames to the `part_index` each one starts at,
/// defining how fragments are grouped into output files (§4.9).
#[derive(Debug, Clone, Default)]
pub struct FileGroupMap {
    /// Sorted by starting `part_index`; the next entry's start bounds the
    /// previous group.
    starts: BTreeMap<u64, String>,
}

impl FileGroupMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, start_part_index: u64, filename: impl Into<String>) {
        self.starts.insert(start_part_index, filename.into());
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Groups `fragments` by destination filename, ordered within each
    /// group by `part_index` ascending (§4.9, §8 Merge ordering).
    pub fn group(&self, mut fragments: Vec<AudioFragment>) -> Vec<(String, Vec<AudioFragment>)> {
        fragments.sort_by_key(|f| f.part_index);

        let mut groups: Vec<(String, Vec<AudioFragment>)> = Vec::new();
        for fragment in fragments {
            let filename = self
                .starts
                .range(..=fragment.part_index)
                .next_back()
                .map(|(_, name)| name.clone())
                .unwrap_or_else(|| "output".to_string());

            match groups.last_mut() {
                Some((name, bucket)) if *name == filename => bucket.push(fragment),
                _ => groups.push((filename, vec![fragment])),
            }
        }
        groups
    }
}

/// Concatenates raw container bytes as-is (mp3 and other stream-friendly
/// formats, §4.9).
pub fn merge_binary(fragments: &[AudioFragment]) -> Vec<u8> {
    let mut out = Vec::new();
    for fragment in fragments {
        out.extend_from_slice(&fragment.bytes);
    }
    out
}

struct WavInfo {
    fmt_content: Vec<u8>,
    data: Vec<u8>,
}

fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(anyhow!("not a RIFF/WAVE buffer"));
    }

    let mut offset = 12usize;
    let mut fmt_content: Option<Vec<u8>> = None;
    let mut data: Option<Vec<u8>> = None;

    while offset + 8 <= bytes.len() {
        let chunk_id = &bytes[offset..offset + 4];
        let chunk_size =
            u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()) as usize;
        let body_start = offset + 8;
        let body_end = (body_start + chunk_size).min(bytes.len());

        if chunk_id == b"fmt " {
            fmt_content = Some(bytes[body_start..body_end].to_vec());
        } else if chunk_id == b"data" {
            data = Some(bytes[body_start..body_end].to_vec());
            break;
        }
        offset = body_end;
    }

    Ok(WavInfo {
        fmt_content: fmt_content.ok_or_else(|| anyhow!("missing fmt chunk"))?,
        data: data.ok_or_else(|| anyhow!("missing data chunk"))?,
    })
}

/// Parses each fragment as a WAV buffer and concatenates `data` chunks,
/// verifying `fmt` chunks match across fragments (§4.9).
pub fn merge_wav(fragments: &[AudioFragment]) -> Result<Vec<u8>> {
    if fragments.is_empty() {
        return Ok(Vec::new());
    }

    let mut infos = Vec::with_capacity(fragments.len());
    let first = scan_wav(&fragments[0].bytes).context("failed to parse first WAV fragment")?;
    let base_fmt = first.fmt_content.clone();
    infos.push(first);

    for fragment in &fragments[1..] {
        let info = scan_wav(&fragment.bytes)
            .with_context(|| format!("failed to parse WAV fragment {}", fragment.part_index))?;
        if info.fmt_content != base_fmt {
            return Err(anyhow!(
                "WAV format mismatch in fragment {}: all fragments must share sample rate/channels",
                fragment.part_index
            ));
        }
        infos.push(info);
    }

    let total_data_size: usize = infos.iter().map(|i| i.data.len()).sum();
    let mut out = Vec::with_capacity(12 + 8 + base_fmt.len() + 8 + total_data_size);

    out.extend_from_slice(b"RIFF");
    let chunk_size = 4 + 8 + base_fmt.len() as u32 + 8 + total_data_size as u32;
    out.extend_from_slice(&chunk_size.to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&(base_fmt.len() as u32).to_le_bytes());
    out.extend_from_slice(&base_fmt);

    out.extend_from_slice(b"data");
    out.extend_from_slice(&(total_data_size as u32).to_le_bytes());
    for info in &infos {
        out.extend_from_slice(&info.data);
    }

    Ok(out)
}

/// Post-merge processing hook (§4.9, §6): silence trimming and loudness
/// normalization via the external audio backend, interface-only here.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn load(&self) -> bool;
    async fn process(&self, bytes: Vec<u8>, silence_removal: bool, normalization: bool) -> Result<Vec<u8>>;
}

/// Merges, optionally post-processes, and writes every file group via
/// `storage`.
pub async fn merge_and_write(
    groups: Vec<(String, Vec<AudioFragment>)>,
    output_format: &str,
    backend: Option<&dyn AudioBackend>,
    silence_removal: bool,
    normalization: bool,
    storage: &dyn Storage,
) -> Result<()> {
    for (filename, fragments) in groups {
        let merged = if output_format.eq_ignore_ascii_case("wav") {
            merge_wav(&fragments)?
        } else {
            merge_binary(&fragments)
        };

        let final_bytes = if let Some(backend) = backend {
            if silence_removal || normalization {
                backend.process(merged, silence_removal, normalization).await?
            } else {
                merged
            }
        } else {
            merged
        };

        storage.write(&filename, &final_bytes).await?;
    }
    Ok(())
}
