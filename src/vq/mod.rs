//! # Vector quantization
//!
//! A learned codebook of `K` embeddings of dimension `D`. Continuous encoder
//! outputs are snapped to their nearest embedding; the straight-through path
//! lets the decoder's gradient flow back to the encoder unchanged.
use tch::{nn, Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct VqEmbeddingConfig {
    pub num_clusters: i64,
    pub embedding_dim: i64,
}

impl Default for VqEmbeddingConfig {
    fn default() -> Self {
        Self { num_clusters: 512, embedding_dim: 64 }
    }
}

/// The tensors produced by one straight-through quantization.
#[derive(Debug)]
pub struct VqOutput {
    /// Quantized `[B, D, H, W]` tensor whose gradient is copied to the encoder output.
    pub z_q_x_st: Tensor,
    /// The same embeddings gathered from the trainable codebook.
    pub z_q_x: Tensor,
    /// `[B, H, W]` indices of the selected embeddings.
    pub latents: Tensor,
}

#[derive(Debug)]
pub struct VqEmbedding {
    pub embedding: Tensor,
    pub config: VqEmbeddingConfig,
}

impl VqEmbedding {
    pub fn new(vs: nn::Path, config: VqEmbeddingConfig) -> Self {
        let bound = 1. / config.num_clusters as f64;
        let embedding = vs.var(
            "weight",
            &[config.num_clusters, config.embedding_dim],
            nn::Init::Uniform { lo: -bound, up: bound },
        );
        Self { embedding, config }
    }

    /// Nearest-embedding index for every spatial vector of a `[B, D, H, W]` input.
    /// Distances are squared Euclidean; the lowest index wins a tie.
    pub fn lookup(&self, z_e_x: &Tensor) -> Tensor {
        let size = z_e_x.size();
        let (b, d, h, w) = (size[0], size[1], size[2], size[3]);
        let inputs = z_e_x.detach().permute([0, 2, 3, 1]).reshape([-1, d]);
        let codebook = self.embedding.detach();
        let inputs_sq = inputs.square().sum_dim_intlist(1, true, Kind::Float);
        let codebook_sq = codebook.square().sum_dim_intlist(1, false, Kind::Float);
        let distances = inputs_sq + codebook_sq.unsqueeze(0) - inputs.mm(&codebook.transpose(0, 1)) * 2.;
        distances.argmin(1, false).view([b, h, w])
    }

    fn gather(codebook: &Tensor, latents: &Tensor, size: &[i64]) -> Tensor {
        let (b, d, h, w) = (size[0], size[1], size[2], size[3]);
        codebook
            .index_select(0, &latents.view(-1))
            .view([b, h, w, d])
            .permute([0, 3, 1, 2])
    }

    /// Quantizes `z_e_x` and returns both the straight-through tensor, built from
    /// the detached codebook, and the codebook-tracked tensor used by the
    /// codebook and commitment losses.
    pub fn straight_through(&self, z_e_x: &Tensor) -> VqOutput {
        let size = z_e_x.size();
        let latents = self.lookup(z_e_x);
        let quantized = Self::gather(&self.embedding.detach(), &latents, &size);
        // `z_e_x - z_e_x.detach()` is exactly zero in the forward pass and the
        // identity in the backward pass.
        let z_q_x_st = quantized + (z_e_x - z_e_x.detach());
        let z_q_x = Self::gather(&self.embedding, &latents, &size);
        VqOutput { z_q_x_st, z_q_x, latents }
    }
}
