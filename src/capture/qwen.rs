//! Qwen2-family decoder with per-layer tap points.
//!
//! A plain no-cache decoder: every generation step re-runs the full
//! sequence, so the final pass doubles as the tapped pass and sees the
//! whole prompt-plus-continuation at once. Weights come from the hub,
//! F16 on CUDA with an F32 CPU fallback.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail};
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Activation, Embedding, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use nalgebra::DMatrix;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::{TapOptions, TapRecording, TappedDecoder};
use crate::config::CaptureKnobs;

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub max_position_embeddings: usize,
    pub rope_theta: f64,
    pub rms_norm_eps: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

#[derive(Debug, Clone)]
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let (_b_sz, _seq_len, hidden_size) = x.dims3()?;
        let norm_x = (x.sqr()?.sum_keepdim(2)? / (hidden_size as f64))?;
        let x_normed = x.broadcast_div(&(norm_x + self.eps)?.sqrt()?)?;
        x_normed.to_dtype(x_dtype)?.broadcast_mul(&self.weight)
    }
}

#[derive(Debug, Clone)]
struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(dtype: DType, cfg: &Config, dev: &Device) -> Result<Self> {
        let dim = cfg.hidden_size / cfg.num_attention_heads;
        let max_seq_len = cfg.max_position_embeddings;
        let inv_freq: Vec<_> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / (cfg.rope_theta as f32).powf(i as f32 / dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), dev)?.to_dtype(dtype)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, dev)?
            .to_dtype(dtype)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self {
            sin: freqs.sin()?,
            cos: freqs.cos()?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, seq_len: usize) -> Result<(Tensor, Tensor)> {
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let q_embed = candle_nn::rotary_emb::rope(q, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(k, &cos, &sin)?;
        Ok((q_embed, k_embed))
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act_fn: Activation,
}

impl Mlp {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let gate_proj =
            candle_nn::linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("gate_proj"))?;
        let up_proj =
            candle_nn::linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("up_proj"))?;
        let down_proj =
            candle_nn::linear_no_bias(cfg.intermediate_size, cfg.hidden_size, vb.pp("down_proj"))?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            act_fn: Activation::Silu,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let lhs = self.gate_proj.forward(x)?.apply(&self.act_fn)?;
        let rhs = self.up_proj.forward(x)?;
        self.down_proj.forward(&(lhs * rhs)?)
    }
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        let q_proj = candle_nn::linear(
            cfg.hidden_size,
            cfg.num_attention_heads * head_dim,
            vb.pp("q_proj"),
        )?;
        let k_proj = candle_nn::linear(
            cfg.hidden_size,
            cfg.num_key_value_heads * head_dim,
            vb.pp("k_proj"),
        )?;
        let v_proj = candle_nn::linear(
            cfg.hidden_size,
            cfg.num_key_value_heads * head_dim,
            vb.pp("v_proj"),
        )?;
        let o_proj = candle_nn::linear_no_bias(
            cfg.num_attention_heads * head_dim,
            cfg.hidden_size,
            vb.pp("o_proj"),
        )?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary_emb: &RotaryEmbedding,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, hidden_size) = x.dims3()?;
        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary_emb.apply(&q, &k, seq_len)?;

        // Repeat k/v heads if necessary (GQA).
        let k = self.repeat_kv(k)?;
        let v = self.repeat_kv(v)?;

        let att = (q.matmul(&k.t()?)? * self.scale)?;
        let att = match mask {
            Some(mask) => att.broadcast_add(mask)?,
            None => att,
        };
        let att = candle_nn::ops::softmax(&att, D::Minus1)?;
        let y = att.matmul(&v.contiguous()?)?;
        let y = y
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, hidden_size))?;
        self.o_proj.forward(&y)
    }

    fn repeat_kv(&self, x: Tensor) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            Ok(x)
        } else {
            let (b, n_kv_head, seq_len, head_dim) = x.dims4()?;
            let x = x
                .unsqueeze(2)?
                .expand((b, n_kv_head, n_rep, seq_len, head_dim))?;
            x.reshape((b, n_kv_head * n_rep, seq_len, head_dim))
        }
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            input_layernorm: RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::new(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary_emb: &RotaryEmbedding,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary_emb, mask)?;
        let x = (x + residual)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        x + residual
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary_emb: RotaryEmbedding,
    device: Device,
    dtype: DType,
    pub config: Config,
}

impl Model {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(DecoderLayer::new(cfg, vb.pp(format!("layers.{i}")))?);
        }
        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;

        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        let rotary_emb = RotaryEmbedding::new(vb.dtype(), cfg, vb.device())?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary_emb,
            device: vb.device().clone(),
            dtype: vb.dtype(),
            config: cfg.clone(),
        })
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn causal_mask(&self, seq_len: usize) -> Result<Option<Tensor>> {
        if seq_len <= 1 {
            return Ok(None);
        }
        let mut data = vec![0f32; seq_len * seq_len];
        for i in 0..seq_len {
            for j in (i + 1)..seq_len {
                data[i * seq_len + j] = f32::NEG_INFINITY;
            }
        }
        let mask = Tensor::from_vec(data, (seq_len, seq_len), &self.device)?
            .to_dtype(self.dtype)?;
        Ok(Some(mask))
    }

    /// Full forward pass; each layer listed in `taps` has its output hidden
    /// states recorded. An empty tap list records nothing.
    pub fn forward_tapped(
        &self,
        input_ids: &Tensor,
        taps: &[usize],
    ) -> Result<(Tensor, BTreeMap<usize, Tensor>)> {
        let (_b, seq_len) = input_ids.dims2()?;
        let mask = self.causal_mask(seq_len)?;

        let mut x = self.embed_tokens.forward(input_ids)?;
        let mut tapped = BTreeMap::new();
        for (idx, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x, &self.rotary_emb, mask.as_ref())?;
            if taps.contains(&idx) {
                tapped.insert(idx, x.clone());
            }
        }
        let x = self.norm.forward(&x)?;
        let logits = self.lm_head.forward(&x)?;
        Ok((logits, tapped))
    }
}

/// Hub-backed backend implementing the tap capability.
pub struct QwenBackend {
    model: Model,
    tokenizer: Tokenizer,
    device: Device,
}

impl QwenBackend {
    pub fn load(knobs: &CaptureKnobs) -> anyhow::Result<Self> {
        let device = Device::cuda_if_available(0)?;
        device.set_seed(knobs.seed)?;

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            knobs.model_repo.clone(),
            RepoType::Model,
            knobs.revision.clone(),
        ));

        let tokenizer_filename = repo.get("tokenizer.json")?;
        let config_filename = repo.get("config.json")?;
        let model_filename = repo.get("model.safetensors")?;

        let config: Config = serde_json::from_slice(&std::fs::read(config_filename)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename).map_err(|e| anyhow!(e))?;

        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_filename], dtype, &device)?
        };
        // The safetensors tree roots at "model." (embed_tokens, layers, ...).
        let model = Model::new(&config, vb.pp("model"))?;

        info!(
            repo = %knobs.model_repo,
            layers = model.layer_count(),
            cuda = device.is_cuda(),
            "capture backend ready"
        );
        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    /// Keep the trailing `capture_tokens` positions at `token_stride`,
    /// detached to an f32 host matrix.
    fn slice_capture_window(hidden: &Tensor, opts: &TapOptions) -> anyhow::Result<DMatrix<f32>> {
        let (_b, seq_len, _hidden) = hidden.dims3()?;
        let keep = opts.capture_tokens.min(seq_len);
        let start = seq_len - keep;
        let window = hidden.narrow(1, start, keep)?;

        let stride = opts.token_stride.max(1);
        let indices: Vec<u32> = (0..keep).step_by(stride).map(|i| i as u32).collect();
        let index = Tensor::new(indices.as_slice(), window.device())?;
        let strided = window.index_select(&index, 1)?;

        let rows = strided
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .to_vec2::<f32>()?;
        let ncols = rows.first().map(Vec::len).unwrap_or(0);
        Ok(DMatrix::from_row_iterator(
            rows.len(),
            ncols,
            rows.into_iter().flatten(),
        ))
    }
}

impl TappedDecoder for QwenBackend {
    fn layer_count(&self) -> usize {
        self.model.layer_count()
    }

    fn generate_tapped(
        &mut self,
        prompt: &str,
        taps: &[usize],
        opts: &TapOptions,
    ) -> anyhow::Result<TapRecording> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!(e))?;
        let mut tokens: Vec<u32> = encoding.get_ids().to_vec();
        if tokens.len() > opts.max_input_tokens {
            tokens.truncate(opts.max_input_tokens);
        }
        if tokens.is_empty() {
            bail!("prompt tokenized to nothing");
        }

        let eos = self.model.config.eos_token_id;
        for _ in 0..opts.max_new_tokens {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let (logits, _) = self.model.forward_tapped(&input, &[])?;
            let last = logits
                .narrow(1, tokens.len() - 1, 1)?
                .squeeze(1)?
                .squeeze(0)?;
            let next = last.argmax(D::Minus1)?.to_scalar::<u32>()?;
            if eos == Some(next) {
                break;
            }
            tokens.push(next);
        }
        debug!(tokens = tokens.len(), taps = taps.len(), "tapped generation done");

        // Final pass over the whole sequence records the taps.
        let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let (_, tapped) = self.model.forward_tapped(&input, taps)?;

        let mut activations = BTreeMap::new();
        for (layer, hidden) in tapped {
            activations.insert(layer, Self::slice_capture_window(&hidden, opts)?);
        }
        Ok(TapRecording {
            activations,
            tokens,
        })
    }
}
