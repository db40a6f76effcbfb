//! Rectified-flow edit sampling. The reference image rides along as extra
//! sequence tokens and predictions are true-CFG mixed between the
//! conditional and unconditional branches.

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_transformers::models::flux::model::Flux;
use candle_transformers::models::flux::sampling::State;
use candle_transformers::models::flux::WithForward;

/// Rearranges a (b, c, h, w) latent into the transformer's token layout
/// (b, h/2 * w/2, c * 4).
pub fn pack_latent(latent: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = latent.dims4()?;
    let packed = latent
        .reshape((b, c, h / 2, 2, w / 2, 2))?
        .permute((0, 2, 4, 1, 3, 5))?
        .reshape((b, h / 2 * (w / 2), c * 4))?;
    Ok(packed)
}

/// Position ids for the reference tokens. The leading coordinate is offset to
/// 1 so the transformer can tell the reference sequence from the canvas.
pub fn reference_ids(latent: &Tensor, device: &Device) -> Result<Tensor> {
    let (_b, _c, h, w) = latent.dims4()?;
    let (h2, w2) = (h / 2, w / 2);
    let mut ids = Vec::with_capacity(h2 * w2 * 3);
    for y in 0..h2 {
        for x in 0..w2 {
            ids.push(1f32);
            ids.push(y as f32);
            ids.push(x as f32);
        }
    }
    Ok(Tensor::from_vec(ids, (1, h2 * w2, 3), device)?)
}

/// Steps the canvas tokens from noise to the edited latent. The reference
/// tokens are appended to every forward pass but never integrated.
#[allow(clippy::too_many_arguments)]
pub fn denoise_edit(
    model: &Flux,
    state: &State,
    neg_state: &State,
    reference: &Tensor,
    reference_ids: &Tensor,
    timesteps: &[f64],
    guidance: f64,
    true_cfg: f64,
) -> Result<Tensor> {
    let b_sz = state.img.dim(0)?;
    let dev = state.img.device();
    let guidance = Tensor::full(guidance as f32, b_sz, dev)?;
    let canvas_len = state.img.dim(1)?;
    let img_ids = Tensor::cat(&[&state.img_ids, reference_ids], 1)?;
    let use_cfg = (true_cfg - 1.0).abs() > f64::EPSILON;

    let mut img = state.img.clone();
    for window in timesteps.windows(2) {
        let (t_curr, t_prev) = match window {
            [a, b] => (*a, *b),
            _ => continue,
        };
        let t_vec = Tensor::full(t_curr as f32, b_sz, dev)?;
        let tokens = Tensor::cat(&[&img, reference], 1)?;
        let cond = model
            .forward(
                &tokens,
                &img_ids,
                &state.txt,
                &state.txt_ids,
                &t_vec,
                &state.vec,
                Some(&guidance),
            )?
            .narrow(1, 0, canvas_len)?;
        let pred = if use_cfg {
            let uncond = model
                .forward(
                    &tokens,
                    &img_ids,
                    &neg_state.txt,
                    &neg_state.txt_ids,
                    &t_vec,
                    &neg_state.vec,
                    Some(&guidance),
                )?
                .narrow(1, 0, canvas_len)?;
            (&uncond + ((cond - &uncond)? * true_cfg)?)?
        } else {
            cond
        };
        img = (img + (pred * (t_prev - t_curr))?)?;
    }
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    #[test]
    fn pack_latent_produces_token_layout() {
        let latent = Tensor::arange(0f32, 64f32, &Device::Cpu)
            .unwrap()
            .reshape((1, 4, 4, 4))
            .unwrap();
        let packed = pack_latent(&latent).unwrap();
        assert_eq!(packed.dims(), &[1, 4, 16]);

        // First token is the top-left 2x2 patch across all channels.
        let first = packed.i((0, 0)).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(&first[..4], &[0.0, 1.0, 4.0, 5.0]);
    }

    #[test]
    fn reference_ids_are_offset_from_the_canvas() {
        let latent = Tensor::zeros((1, 16, 4, 6), candle_core::DType::F32, &Device::Cpu).unwrap();
        let ids = reference_ids(&latent, &Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[1, 6, 3]);

        let flat = ids.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(&flat[..3], &[1.0, 0.0, 0.0]);
        assert_eq!(&flat[flat.len() - 3..], &[1.0, 1.0, 2.0]);
    }
}
