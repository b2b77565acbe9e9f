//! Checkpoint loading
//!
//! A checkpoint is a directory holding:
//! - `config.json` (see [`ModelConfig`])
//! - `model.safetensors`, or `model.safetensors.index.json` plus its shards
//! - `src_vocab.json` and `tgt_vocab.json` (JSON token arrays)

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use memmap2::Mmap;
use safetensors::SafeTensors;
use serde::Deserialize;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::Seq2SeqTransformer;
use crate::vocab::Vocab;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
pub const SRC_VOCAB_FILE: &str = "src_vocab.json";
pub const TGT_VOCAB_FILE: &str = "tgt_vocab.json";

/// Index file structure for sharded checkpoints
#[derive(Debug, Deserialize)]
pub struct SafetensorsIndex {
    pub metadata: Option<serde_json::Value>,
    pub weight_map: HashMap<String, String>,
}

/// Model plus the vocabularies it was trained with
pub struct Checkpoint {
    pub model: Seq2SeqTransformer,
    pub src_vocab: Vocab,
    pub tgt_vocab: Vocab,
}

/// Load model and vocabularies. Fails before touching any weights if the
/// directory does not exist.
pub fn load_checkpoint<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Checkpoint> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Err(Error::CheckpointNotFound(dir.to_path_buf()));
    }

    let config = ModelConfig::from_file(dir.join(CONFIG_FILE))?;
    let src_vocab = Vocab::from_file(dir.join(SRC_VOCAB_FILE))?;
    let tgt_vocab = Vocab::from_file(dir.join(TGT_VOCAB_FILE))?;
    check_vocab_size("source", config.src_vocab_size, &src_vocab)?;
    check_vocab_size("target", config.tgt_vocab_size, &tgt_vocab)?;

    let dtype = config.candle_dtype();
    tracing::info!(
        "Model config: {} encoder / {} decoder layers, {} hidden, dtype={:?}",
        config.num_encoder_layers,
        config.num_decoder_layers,
        config.hidden_size,
        dtype
    );

    let vb = load_model_vb(dir, dtype, device)?;
    let model = Seq2SeqTransformer::new(&config, vb, device)?;

    Ok(Checkpoint {
        model,
        src_vocab,
        tgt_vocab,
    })
}

fn check_vocab_size(side: &str, expected: usize, vocab: &Vocab) -> Result<()> {
    if vocab.len() != expected {
        return Err(Error::Config(format!(
            "{side} vocabulary has {} tokens, model expects {expected}",
            vocab.len()
        )));
    }
    Ok(())
}

/// Build a VarBuilder from single-file or sharded safetensors weights
pub fn load_model_vb<P: AsRef<Path>>(
    dir: P,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let dir = dir.as_ref();
    let index_path = dir.join(WEIGHTS_INDEX_FILE);
    let single_path = dir.join(WEIGHTS_FILE);

    let tensors = if index_path.exists() {
        load_sharded(dir, &index_path, dtype, device)?
    } else if single_path.exists() {
        load_safetensors_file(&single_path, dtype, device)?
    } else {
        return Err(Error::Config(format!(
            "no {WEIGHTS_FILE} or {WEIGHTS_INDEX_FILE} in {}",
            dir.display()
        )));
    };

    tracing::info!("Loaded {} tensors", tensors.len());
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}

fn load_sharded(
    dir: &Path,
    index_path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let content = std::fs::read_to_string(index_path)
        .map_err(|e| Error::io(format!("failed to read {}", index_path.display()), e))?;
    let index: SafetensorsIndex = serde_json::from_str(&content)?;

    let mut shards: Vec<&String> = index.weight_map.values().collect();
    shards.sort();
    shards.dedup();

    let mut all = HashMap::with_capacity(index.weight_map.len());
    for (i, shard) in shards.iter().enumerate() {
        tracing::debug!("Loading shard {}/{}: {}", i + 1, shards.len(), shard);
        let tensors = load_safetensors_file(&dir.join(shard), dtype, device)?;
        for (name, tensor) in tensors {
            if index.weight_map.get(&name) == Some(*shard) {
                all.insert(name, tensor);
            }
        }
    }
    Ok(all)
}

fn load_safetensors_file(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::io(format!("failed to open {}", path.display()), e))?;
    // SAFETY: the checkpoint file is not modified while mapped
    let mmap = unsafe { Mmap::map(&file) }
        .map_err(|e| Error::io(format!("failed to mmap {}", path.display()), e))?;
    let st = SafeTensors::deserialize(&mmap)?;

    let mut tensors = HashMap::new();
    for name in st.names() {
        let view = st.tensor(name)?;
        tensors.insert(name.to_string(), tensor_from_view(&view, dtype, device)?);
    }
    Ok(tensors)
}

/// Decode little-endian element bytes of width `N`
fn decode_le<T, const N: usize>(data: &[u8], from: fn([u8; N]) -> T) -> Vec<T> {
    data.chunks_exact(N)
        .map(|b| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(b);
            from(bytes)
        })
        .collect()
}

/// Convert a safetensors view to a candle tensor; float tensors are cast to `dtype`
fn tensor_from_view(
    view: &safetensors::tensor::TensorView,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    use safetensors::Dtype as St;

    let shape = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        St::BF16 => Tensor::from_vec(decode_le(data, half::bf16::from_le_bytes), shape, device)?,
        St::F16 => Tensor::from_vec(decode_le(data, half::f16::from_le_bytes), shape, device)?,
        St::F32 => Tensor::from_vec(decode_le(data, f32::from_le_bytes), shape, device)?,
        St::F64 => Tensor::from_vec(decode_le(data, f64::from_le_bytes), shape, device)?,
        St::U32 => Tensor::from_vec(decode_le(data, u32::from_le_bytes), shape, device)?,
        St::I64 => Tensor::from_vec(decode_le(data, i64::from_le_bytes), shape, device)?,
        other => {
            return Err(Error::Config(format!("unsupported tensor dtype {other:?}")));
        }
    };

    if tensor.dtype().is_float() && tensor.dtype() != dtype {
        Ok(tensor.to_dtype(dtype)?)
    } else {
        Ok(tensor)
    }
}
