//! Nearest-codeword quantizers: k-means for semantic tokens and a residual
//! VQ stack for CLAP embeddings.

use candle_core::{D, DType, Tensor};
use candle_nn::VarBuilder;

use crate::Result;

/// Index of the nearest row of `codebook` ([K, D]) for each row of `x` ([N, D]).
///
/// Uses `|x|^2 - 2 x.c + |c|^2`, which avoids materializing [N, K, D].
fn nearest(x: &Tensor, codebook: &Tensor, codebook_sq: &Tensor) -> Result<Tensor> {
    let x_sq = x.sqr()?.sum_keepdim(D::Minus1)?; // [N, 1]
    let dots = x.matmul(&codebook.t()?)?; // [N, K]
    let dist = dots
        .affine(-2.0, 0.0)?
        .broadcast_add(&x_sq)?
        .broadcast_add(codebook_sq)?;
    Ok(dist.argmin(D::Minus1)?)
}

/// K-means cluster centers.
pub struct KMeans {
    centers: Tensor,
    centers_sq: Tensor,
}

impl KMeans {
    pub fn new(centers: Tensor) -> Result<Self> {
        let centers = centers.to_dtype(DType::F32)?;
        let centers_sq = centers.sqr()?.sum(D::Minus1)?.unsqueeze(0)?; // [1, K]
        Ok(Self {
            centers,
            centers_sq,
        })
    }

    /// `cluster_centers`: [num_clusters, dim].
    pub fn load(vb: VarBuilder, num_clusters: usize, dim: usize) -> Result<Self> {
        Self::new(vb.get((num_clusters, dim), "cluster_centers")?)
    }

    pub fn num_clusters(&self) -> usize {
        self.centers.dim(0).unwrap_or(0)
    }

    /// Cluster id for each row of `x` ([N, D]).
    pub fn assign(&self, x: &Tensor) -> Result<Vec<u32>> {
        let x = x.to_dtype(DType::F32)?;
        Ok(nearest(&x, &self.centers, &self.centers_sq)?.to_vec1::<u32>()?)
    }
}

/// Residual vector quantizer: each level quantizes what the previous
/// levels left over.
pub struct ResidualVq {
    codebooks: Vec<(Tensor, Tensor)>,
}

impl ResidualVq {
    pub fn new(codebooks: Vec<Tensor>) -> Result<Self> {
        let codebooks = codebooks
            .into_iter()
            .map(|cb| -> Result<(Tensor, Tensor)> {
                let cb = cb.to_dtype(DType::F32)?;
                let sq = cb.sqr()?.sum(D::Minus1)?.unsqueeze(0)?;
                Ok((cb, sq))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { codebooks })
    }

    /// `layers.{i}._codebook.embed`: [1, codebook_size, dim] per level.
    pub fn load(
        vb: VarBuilder,
        num_quantizers: usize,
        codebook_size: usize,
        dim: usize,
    ) -> Result<Self> {
        let codebooks = (0..num_quantizers)
            .map(|i| -> Result<Tensor> {
                let embed = vb
                    .pp(format!("layers.{i}._codebook"))
                    .get((1, codebook_size, dim), "embed")?;
                Ok(embed.squeeze(0)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(codebooks)
    }

    pub fn num_quantizers(&self) -> usize {
        self.codebooks.len()
    }

    /// Codes `[N, num_quantizers]` (row-major) and the final residual.
    pub fn encode(&self, x: &Tensor) -> Result<(Vec<u32>, Tensor)> {
        let mut residual = x.to_dtype(DType::F32)?;
        let n = residual.dim(0)?;
        let mut per_level = Vec::with_capacity(self.codebooks.len());
        for (codebook, codebook_sq) in &self.codebooks {
            let idx = nearest(&residual, codebook, codebook_sq)?;
            let quantized = codebook.index_select(&idx, 0)?;
            residual = (residual - quantized)?;
            per_level.push(idx.to_vec1::<u32>()?);
        }
        let q = per_level.len();
        let mut codes = vec![0u32; n * q];
        for (level, idx) in per_level.iter().enumerate() {
            for (row, &code) in idx.iter().enumerate() {
                codes[row * q + level] = code;
            }
        }
        Ok((codes, residual))
    }
}
