//! Box geometry
//!
//! Boxes come in two layouts:
//! - center/size `[cx, cy, w, h]`, the layout predicted by the decoder and
//!   stored in ground truth (normalized to [0, 1])
//! - corners `[x1, y1, x2, y2]`, used for IoU and for final detections
//!
//! Every function exists in a scalar form over `[f32; 4]` (used by the
//! denoising generator and the NMS path) and a batched tensor form (used by
//! the matcher and the losses, where gradients must flow).

use candle_core::{Result, Tensor, D};

/// Denominator floor for IoU/GIoU so degenerate boxes give 0 instead of NaN.
const AREA_EPS: f64 = 1e-9;

/// Convert a `[cx, cy, w, h]` box to `[x1, y1, x2, y2]`.
pub fn to_corners(b: [f32; 4]) -> [f32; 4] {
    let [cx, cy, w, h] = b;
    [cx - 0.5 * w, cy - 0.5 * h, cx + 0.5 * w, cy + 0.5 * h]
}

/// Convert a `[x1, y1, x2, y2]` box to `[cx, cy, w, h]`.
pub fn to_center_size(b: [f32; 4]) -> [f32; 4] {
    let [x1, y1, x2, y2] = b;
    [(x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1]
}

/// Area of a corner-format box; inverted boxes have zero area.
pub fn area(b: [f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

fn intersection_and_union(a: [f32; 4], b: [f32; 4]) -> (f32, f32) {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    (inter, area(a) + area(b) - inter)
}

/// Intersection over union of two corner-format boxes.
///
/// Returns 0 when the union is empty (both boxes degenerate).
pub fn iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let (inter, union) = intersection_and_union(a, b);
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Generalized IoU of two corner-format boxes, in [-1, 1].
///
/// Returns 0 when both boxes have zero area, wherever they are.
pub fn giou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let (inter, union) = intersection_and_union(a, b);
    if union <= 0.0 {
        return 0.0;
    }
    let cw = (a[2].max(b[2]) - a[0].min(b[0])).max(0.0);
    let ch = (a[3].max(b[3]) - a[1].min(b[1])).max(0.0);
    let enclosing = cw * ch;
    inter / union - (enclosing - union) / enclosing
}

/// `[.., 4]` center/size tensor to corners.
pub fn box_cxcywh_to_xyxy(boxes: &Tensor) -> Result<Tensor> {
    let cx = boxes.narrow(D::Minus1, 0, 1)?;
    let cy = boxes.narrow(D::Minus1, 1, 1)?;
    let half_w = (boxes.narrow(D::Minus1, 2, 1)? * 0.5)?;
    let half_h = (boxes.narrow(D::Minus1, 3, 1)? * 0.5)?;
    Tensor::cat(
        &[
            (&cx - &half_w)?,
            (&cy - &half_h)?,
            (&cx + &half_w)?,
            (&cy + &half_h)?,
        ],
        D::Minus1,
    )
}

/// `[.., 4]` corner tensor to center/size.
pub fn box_xyxy_to_cxcywh(boxes: &Tensor) -> Result<Tensor> {
    let x1 = boxes.narrow(D::Minus1, 0, 1)?;
    let y1 = boxes.narrow(D::Minus1, 1, 1)?;
    let x2 = boxes.narrow(D::Minus1, 2, 1)?;
    let y2 = boxes.narrow(D::Minus1, 3, 1)?;
    Tensor::cat(
        &[
            ((&x1 + &x2)? * 0.5)?,
            ((&y1 + &y2)? * 0.5)?,
            (&x2 - &x1)?,
            (&y2 - &y1)?,
        ],
        D::Minus1,
    )
}

/// Area of `[N, 4]` corner boxes, `[N]`.
pub fn box_area(boxes: &Tensor) -> Result<Tensor> {
    let w = (boxes.narrow(D::Minus1, 2, 1)? - boxes.narrow(D::Minus1, 0, 1)?)?.relu()?;
    let h = (boxes.narrow(D::Minus1, 3, 1)? - boxes.narrow(D::Minus1, 1, 1)?)?.relu()?;
    (w * h)?.squeeze(D::Minus1)
}

/// Product of the two extents of a `[.., 2]` width/height tensor.
fn wh_area(wh: &Tensor) -> Result<Tensor> {
    let w = wh.narrow(D::Minus1, 0, 1)?;
    let h = wh.narrow(D::Minus1, 1, 1)?;
    (w * h)?.squeeze(D::Minus1)
}

/// Pairwise IoU of `[N, 4]` and `[M, 4]` corner boxes.
///
/// Returns `(iou, union)`, both `[N, M]`.
pub fn box_iou(a: &Tensor, b: &Tensor) -> Result<(Tensor, Tensor)> {
    let area_a = box_area(a)?;
    let area_b = box_area(b)?;

    let a = a.unsqueeze(1)?; // [N, 1, 4]
    let b = b.unsqueeze(0)?; // [1, M, 4]
    let lt = a
        .narrow(D::Minus1, 0, 2)?
        .broadcast_maximum(&b.narrow(D::Minus1, 0, 2)?)?;
    let rb = a
        .narrow(D::Minus1, 2, 2)?
        .broadcast_minimum(&b.narrow(D::Minus1, 2, 2)?)?;
    let inter = wh_area(&(rb - lt)?.relu()?)?; // [N, M]

    let union = area_a
        .unsqueeze(1)?
        .broadcast_add(&area_b.unsqueeze(0)?)?
        .sub(&inter)?;
    let iou = inter.div(&union.maximum(AREA_EPS)?)?;
    Ok((iou, union))
}

/// Zero `giou` wherever `union` is empty, i.e. both boxes are degenerate.
fn zero_where_empty(giou: &Tensor, union: &Tensor) -> Result<Tensor> {
    union.gt(AREA_EPS)?.where_cond(giou, &giou.zeros_like()?)
}

/// Pairwise generalized IoU of `[N, 4]` and `[M, 4]` corner boxes, `[N, M]`.
///
/// Pairs of zero-area boxes get 0.
pub fn generalized_box_iou(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (iou, union) = box_iou(a, b)?;

    let a = a.unsqueeze(1)?;
    let b = b.unsqueeze(0)?;
    let lt = a
        .narrow(D::Minus1, 0, 2)?
        .broadcast_minimum(&b.narrow(D::Minus1, 0, 2)?)?;
    let rb = a
        .narrow(D::Minus1, 2, 2)?
        .broadcast_maximum(&b.narrow(D::Minus1, 2, 2)?)?;
    let enclosing = wh_area(&(rb - lt)?.relu()?)?;

    let penalty = (&enclosing - &union)?.div(&enclosing.maximum(AREA_EPS)?)?;
    zero_where_empty(&(iou - penalty)?, &union)
}

/// Element-wise generalized IoU of two `[N, 4]` corner tensors, `[N]`.
///
/// This is the diagonal of [`generalized_box_iou`] without materializing the
/// `N x N` matrix.
pub fn paired_generalized_box_iou(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let area_a = box_area(a)?;
    let area_b = box_area(b)?;

    let a_lt = a.narrow(D::Minus1, 0, 2)?;
    let a_rb = a.narrow(D::Minus1, 2, 2)?;
    let b_lt = b.narrow(D::Minus1, 0, 2)?;
    let b_rb = b.narrow(D::Minus1, 2, 2)?;

    let inter = wh_area(&(a_rb.minimum(&b_rb)? - a_lt.maximum(&b_lt)?)?.relu()?)?;
    let union = ((area_a + area_b)? - &inter)?;
    let iou = inter.div(&union.maximum(AREA_EPS)?)?;

    let enclosing = wh_area(&(a_rb.maximum(&b_rb)? - a_lt.minimum(&b_lt)?)?.relu()?)?;
    let penalty = (&enclosing - &union)?.div(&enclosing.maximum(AREA_EPS)?)?;
    zero_where_empty(&(iou - penalty)?, &union)
}

/// Inverse of the logistic function, clamped to stay finite at 0 and 1.
pub fn inverse_sigmoid(x: &Tensor, eps: f64) -> Result<Tensor> {
    let x = x.clamp(0f32, 1f32)?;
    let num = x.maximum(eps)?;
    let den = x.affine(-1.0, 1.0)?.maximum(eps)?;
    num.div(&den)?.log()
}
