//! Label-mask post-processing shared by all segmentation backends.

use ndarray::Array2;

struct Component {
    label: u32,
    first: usize,
    pixels: Vec<(usize, usize)>,
}

/// 4-connected components of every positive label, ordered by
/// (original label, first raster position).
fn components(labels: &Array2<u32>) -> Vec<Component> {
    let (h, w) = labels.dim();
    let mut visited = Array2::<bool>::from_elem((h, w), false);
    let mut out = Vec::new();
    let mut stack = Vec::new();

    for r in 0..h {
        for c in 0..w {
            let label = labels[[r, c]];
            if label == 0 || visited[[r, c]] {
                continue;
            }
            visited[[r, c]] = true;
            stack.push((r, c));
            let mut pixels = Vec::new();
            while let Some((y, x)) = stack.pop() {
                pixels.push((y, x));
                let mut visit = |ny: usize, nx: usize| {
                    if !visited[[ny, nx]] && labels[[ny, nx]] == label {
                        visited[[ny, nx]] = true;
                        stack.push((ny, nx));
                    }
                };
                if y > 0 {
                    visit(y - 1, x);
                }
                if y + 1 < h {
                    visit(y + 1, x);
                }
                if x > 0 {
                    visit(y, x - 1);
                }
                if x + 1 < w {
                    visit(y, x + 1);
                }
            }
            out.push(Component {
                label,
                first: r * w + c,
                pixels,
            });
        }
    }
    out.sort_by_key(|c| (c.label, c.first));
    out
}

/// Split disconnected fragments, drop objects below `min_object_size`
/// pixels and renumber the survivors `1..=n`.
pub fn finalize(raw: &Array2<u32>, min_object_size: usize) -> Array2<u32> {
    let mut out = Array2::<u32>::zeros(raw.dim());
    let mut next = 0u32;
    for comp in components(raw) {
        if comp.pixels.len() < min_object_size.max(1) {
            continue;
        }
        next += 1;
        for (y, x) in comp.pixels {
            out[[y, x]] = next;
        }
    }
    out
}

/// Label the 4-connected components of a foreground mask in raster order.
pub fn label_foreground(foreground: &Array2<bool>) -> Array2<u32> {
    let raw = foreground.mapv(|f| f as u32);
    finalize(&raw, 1)
}

pub fn object_count(labels: &Array2<u32>) -> usize {
    labels.iter().copied().max().unwrap_or(0) as usize
}
