//! Diagonal Gaussian over the last tensor axis.
use candle_core::{Result, Tensor, D};

/// Mean and log standard deviation, both `[..., dim]`.
#[derive(Debug, Clone)]
pub struct GaussianParams {
    pub mean: Tensor,
    pub log_std: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagonalGaussian {
    dim: usize,
}

impl DiagonalGaussian {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `KL(old || new)`, summed over the last axis.
    pub fn kl(&self, old: &GaussianParams, new: &GaussianParams) -> Result<Tensor> {
        let old_std = old.log_std.exp()?;
        let new_std = new.log_std.exp()?;
        let numerator = ((&old.mean - &new.mean)?.sqr()? + old_std.sqr()?)?.sub(&new_std.sqr()?)?;
        let denominator = new_std.sqr()?.affine(2.0, 1e-8)?;
        let terms = ((numerator / denominator)? + (&new.log_std - &old.log_std)?)?;
        terms.sum(D::Minus1)
    }

    pub fn log_likelihood(&self, xs: &Tensor, params: &GaussianParams) -> Result<Tensor> {
        let zs = (xs - &params.mean)?.div(&params.log_std.exp()?)?;
        let log_norm = 0.5 * self.dim as f64 * (2.0 * std::f64::consts::PI).ln();
        let ll = (params.log_std.sum(D::Minus1)?.neg()? - (zs.sqr()?.sum(D::Minus1)? * 0.5)?)?;
        ll.affine(1.0, -log_norm)
    }

    /// `p_new(x) / p_old(x)`.
    pub fn likelihood_ratio(&self, xs: &Tensor, old: &GaussianParams, new: &GaussianParams) -> Result<Tensor> {
        let new_ll = self.log_likelihood(xs, new)?;
        let old_ll = self.log_likelihood(xs, old)?;
        (new_ll - old_ll)?.affine(1.0, 1e-6)?.exp()
    }

    pub fn entropy(&self, params: &GaussianParams) -> Result<Tensor> {
        let c = (2.0 * std::f64::consts::PI * std::f64::consts::E).sqrt().ln();
        params.log_std.affine(1.0, c)?.sum(D::Minus1)
    }

    pub fn sample(&self, params: &GaussianParams) -> Result<Tensor> {
        let noise = params.mean.randn_like(0.0, 1.0)?;
        (noise * params.log_std.exp()?)? + &params.mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn params(mean: &[f32], log_std: &[f32]) -> Result<GaussianParams> {
        let device = Device::Cpu;
        Ok(GaussianParams {
            mean: Tensor::new(mean, &device)?.unsqueeze(0)?,
            log_std: Tensor::new(log_std, &device)?.unsqueeze(0)?,
        })
    }

    #[test]
    fn kl_of_identical_distributions_is_zero() -> Result<()> {
        let dist = DiagonalGaussian::new(2);
        let p = params(&[0.3, -1.0], &[0.1, -0.5])?;
        let kl = dist.kl(&p, &p)?.to_vec1::<f32>()?;
        assert!(kl[0].abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn kl_ratio_and_entropy_between_different_gaussians() -> Result<()> {
        let dist = DiagonalGaussian::new(1);
        let ln2 = 2f32.ln();
        let old = params(&[0.0], &[0.0])?;
        let new = params(&[1.0], &[ln2])?;

        // ln(s_new / s_old) + (s_old^2 + (m_old - m_new)^2) / (2 s_new^2) - 1/2
        let kl = dist.kl(&old, &new)?.to_vec1::<f32>()?;
        assert!((kl[0] - (ln2 + 2.0 / 8.0 - 0.5)).abs() < 1e-5);
        let reverse = dist.kl(&new, &old)?.to_vec1::<f32>()?;
        assert!((reverse[0] - (-ln2 + 5.0 / 2.0 - 0.5)).abs() < 1e-5);

        // at x = 0: N(0; 1, 2) / N(0; 0, 1) = exp(-ln 2 - 1/8)
        let x = Tensor::new(&[[0f32]], &Device::Cpu)?;
        let ratio = dist.likelihood_ratio(&x, &old, &new)?.to_vec1::<f32>()?;
        assert!((ratio[0] - (-ln2 - 0.125).exp()).abs() < 1e-4);

        let half_log_2pi_e = 0.5 * (2.0 * std::f32::consts::PI * std::f32::consts::E).ln();
        let entropy = dist.entropy(&new)?.to_vec1::<f32>()?;
        assert!((entropy[0] - (ln2 + half_log_2pi_e)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn kl_sums_over_dimensions() -> Result<()> {
        let dist = DiagonalGaussian::new(2);
        let old = params(&[0.0, 0.0], &[0.0, 0.0])?;
        let new = params(&[1.0, -1.0], &[0.0, 0.0])?;
        // unit variances: each dimension contributes (m_old - m_new)^2 / 2
        let kl = dist.kl(&old, &new)?.to_vec1::<f32>()?;
        assert!((kl[0] - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn standard_normal_log_likelihood_at_mean() -> Result<()> {
        let dist = DiagonalGaussian::new(1);
        let p = params(&[0.0], &[0.0])?;
        let x = Tensor::new(&[[0f32]], &Device::Cpu)?;
        let ll = dist.log_likelihood(&x, &p)?.to_vec1::<f32>()?;
        let expected = -0.5 * (2.0 * std::f32::consts::PI).ln();
        assert!((ll[0] - expected).abs() < 1e-5);

        let ratio = dist.likelihood_ratio(&x, &p, &p)?.to_vec1::<f32>()?;
        assert!((ratio[0] - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn entropy_grows_with_std() -> Result<()> {
        let dist = DiagonalGaussian::new(1);
        let narrow = dist.entropy(&params(&[0.0], &[-1.0])?)?.to_vec1::<f32>()?;
        let wide = dist.entropy(&params(&[0.0], &[1.0])?)?.to_vec1::<f32>()?;
        assert!((wide[0] - narrow[0] - 2.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn sample_has_parameter_shape() -> Result<()> {
        let dist = DiagonalGaussian::new(3);
        let p = params(&[0.0, 1.0, 2.0], &[-10.0, -10.0, -10.0])?;
        let s = dist.sample(&p)?;
        assert_eq!(s.dims(), &[1, 3]);
        let values = s.to_vec2::<f32>()?;
        assert!((values[0][2] - 2.0).abs() < 1e-3);
        Ok(())
    }
}
