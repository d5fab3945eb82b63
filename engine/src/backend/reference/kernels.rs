/// Software versions of the effect kernels
///
/// Each function is one compute invocation at `id`, written against the
/// same parameter block the GPU programs read. Loads outside the image
/// clamp to the edge; stores outside the image are counted and dropped.
use common::{EffectKind, PixelFormat};

pub type Texel = [f32; 4];

/// Parameter block as the kernels see it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelParams {
    pub values: [f32; 4],
    pub width: u32,
    pub height: u32,
}

/// Read-only snapshot of the bound source texture
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<Texel>,
}

impl SourceImage {
    pub fn load(&self, x: i32, y: i32) -> Texel {
        if self.width == 0 || self.height == 0 {
            return [0.0; 4];
        }
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.texels[y * self.width as usize + x]
    }

    /// Bilinear sample with clamp addressing at normalized `(u, v)`
    pub fn sample_linear(&self, u: f32, v: f32) -> Texel {
        let px = u * self.width as f32 - 0.5;
        let py = v * self.height as f32 - 0.5;
        let x0 = px.floor();
        let y0 = py.floor();
        let fx = px - x0;
        let fy = py - y0;
        let (x0, y0) = (x0 as i32, y0 as i32);

        let top = mix(self.load(x0, y0), self.load(x0 + 1, y0), fx);
        let bottom = mix(self.load(x0, y0 + 1), self.load(x0 + 1, y0 + 1), fx);
        mix(top, bottom, fy)
    }
}

/// The bound destination texture with write bookkeeping
pub struct TargetImage<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub texels: &'a mut [Texel],
    pub writes: &'a mut [u32],
    pub out_of_bounds: &'a mut u64,
}

impl TargetImage<'_> {
    pub fn load(&self, x: i32, y: i32) -> Texel {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return [0.0; 4];
        }
        self.texels[y as usize * self.width as usize + x as usize]
    }

    pub fn store(&mut self, x: u32, y: u32, value: Texel) {
        if x >= self.width || y >= self.height {
            *self.out_of_bounds += 1;
            return;
        }
        let index = y as usize * self.width as usize + x as usize;
        // NaN stores as zero in unorm formats
        self.texels[index] = value.map(|c| {
            let c = if c.is_nan() && self.format != PixelFormat::Rgba32Float {
                0.0
            } else {
                c
            };
            self.format.quantize(c)
        });
        self.writes[index] += 1;
    }
}

/// Run one invocation of `kind` at `id`.
pub fn invoke(
    kind: EffectKind,
    id: (u32, u32),
    params: &KernelParams,
    src: Option<&SourceImage>,
    dst: &mut TargetImage<'_>,
) {
    match kind {
        EffectKind::Copy => copy(id, params, src, dst),
        EffectKind::Flip => flip(id, params, dst),
        EffectKind::Mirror => mirror(id, params, dst),
        EffectKind::Swap => swap(id, params, dst),
        EffectKind::Blur => blur(id, params, src, dst),
        EffectKind::Sharpen => sharpen(id, params, src, dst),
        EffectKind::AdaptiveSharpen => adaptive_sharpen(id, params, src, dst),
        EffectKind::Adjust => adjust(id, params, dst),
        EffectKind::Temperature => temperature(id, params, dst),
    }
}

fn outside(id: (u32, u32), params: &KernelParams) -> bool {
    id.0 >= params.width || id.1 >= params.height
}

fn load_src(src: Option<&SourceImage>, x: i32, y: i32) -> Texel {
    src.map_or([0.0; 4], |s| s.load(x, y))
}

fn copy(id: (u32, u32), params: &KernelParams, src: Option<&SourceImage>, dst: &mut TargetImage<'_>) {
    if outside(id, params) {
        return;
    }
    dst.store(id.0, id.1, load_src(src, id.0 as i32, id.1 as i32));
}

fn bgra(c: Texel) -> Texel {
    [c[2], c[1], c[0], c[3]]
}

fn flip(id: (u32, u32), params: &KernelParams, dst: &mut TargetImage<'_>) {
    // Half the rows swap with their mirror row; an odd middle row stays put
    if id.0 >= params.width || id.1 >= params.height / 2 {
        return;
    }
    let (x, y) = id;
    let ypos = params.height - 1 - y;
    let mut c0 = dst.load(x as i32, y as i32);
    let mut c1 = dst.load(x as i32, ypos as i32);
    if params.values[0] == 1.0 {
        c0 = bgra(c0);
        c1 = bgra(c1);
    }
    dst.store(x, ypos, c0);
    dst.store(x, y, c1);
}

fn mirror(id: (u32, u32), params: &KernelParams, dst: &mut TargetImage<'_>) {
    if id.0 >= params.width / 2 || id.1 >= params.height {
        return;
    }
    let (x, y) = id;
    let xpos = params.width - 1 - x;
    let mut c0 = dst.load(x as i32, y as i32);
    let mut c1 = dst.load(xpos as i32, y as i32);
    if params.values[0] == 1.0 {
        c0 = bgra(c0);
        c1 = bgra(c1);
    }
    dst.store(xpos, y, c0);
    dst.store(x, y, c1);
}

fn swap(id: (u32, u32), params: &KernelParams, dst: &mut TargetImage<'_>) {
    if outside(id, params) {
        return;
    }
    let color = dst.load(id.0 as i32, id.1 as i32);
    dst.store(id.0, id.1, bgra(color));
}

const BLUR_WEIGHTS: [f32; 5] = [0.204164, 0.304005, 0.093913, 0.010381, 0.001097];

fn blur(id: (u32, u32), params: &KernelParams, src: Option<&SourceImage>, dst: &mut TargetImage<'_>) {
    if outside(id, params) {
        return;
    }
    let amount = params.values[0];
    let texel = (1.0 / params.width as f32, 1.0 / params.height as f32);
    let uv = (id.0 as f32 * texel.0, id.1 as f32 * texel.1);
    let offset = (texel.0 * amount, texel.1 * amount);

    let mut color = [0.0f32; 4];
    let mut weight_sum = 0.0;
    for y in -2i32..=2 {
        for x in -2i32..=2 {
            let w = BLUR_WEIGHTS[x.unsigned_abs() as usize] * BLUR_WEIGHTS[y.unsigned_abs() as usize];
            let sample = match src {
                Some(s) => s.sample_linear(uv.0 + x as f32 * offset.0, uv.1 + y as f32 * offset.1),
                None => [0.0; 4],
            };
            for c in 0..4 {
                color[c] += w * sample[c];
            }
            weight_sum += w;
        }
    }
    dst.store(id.0, id.1, color.map(|c| c / weight_sum));
}

fn sharpen(id: (u32, u32), params: &KernelParams, src: Option<&SourceImage>, dst: &mut TargetImage<'_>) {
    if outside(id, params) {
        return;
    }
    let (x, y) = (id.0 as i32, id.1 as i32);
    let d = params.values[0] as i32;
    let load = |dx: i32, dy: i32| load_src(src, x + dx, y + dy);

    let orig = load(0, 0);
    let corners = add4([load(-d, -d), load(d, -d), load(-d, d), load(d, d)]);
    let edges = add4([load(0, -d), load(-d, 0), load(d, 0), load(0, d)]);

    let strength = params.values[1];
    let mut out = [0.0; 4];
    for c in 0..4 {
        let blurred = (corners[c] + 2.0 * edges[c] + 4.0 * orig[c]) / 16.0;
        out[c] = (1.0 + strength) * orig[c] - strength * blurred;
    }
    dst.store(id.0, id.1, out);
}

fn add4(texels: [Texel; 4]) -> Texel {
    let mut sum = [0.0; 4];
    for t in texels {
        for c in 0..4 {
            sum[c] += t[c];
        }
    }
    sum
}

fn luminance(c: [f32; 3], weights: [f32; 3]) -> f32 {
    c[0] * weights[0] + c[1] * weights[1] + c[2] * weights[2]
}

const CAS_LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

fn adaptive_sharpen(
    id: (u32, u32),
    params: &KernelParams,
    src: Option<&SourceImage>,
    dst: &mut TargetImage<'_>,
) {
    if outside(id, params) {
        return;
    }
    let (x, y) = (id.0 as i32, id.1 as i32);
    // The vertical offset comes from the level, so for levels below one
    // both vertical neighbours collapse onto the centre texel
    let dx = params.values[0] as i32;
    let dy = params.values[1] as i32;
    let level = params.values[1];

    let c0 = load_src(src, x, y);
    let col = [c0[0], c0[1], c0[2]];
    let mut max_g = luminance(col, CAS_LUMA);
    let mut min_g = max_g;
    let mut colw = [0.0f32; 3];

    for (ox, oy) in [(-dx, 0), (0, dy), (dx, 0), (0, -dy)] {
        let n = load_src(src, x + ox, y + oy);
        let n = [n[0], n[1], n[2]];
        let g = luminance(n, CAS_LUMA);
        max_g = max_g.max(g);
        min_g = min_g.min(g);
        for c in 0..3 {
            colw[c] += n[c];
        }
    }

    let d_min_g = min_g;
    let d_max_g = 1.0 - max_g;
    let a = if d_max_g < d_min_g {
        d_max_g / max_g
    } else {
        d_min_g / max_g
    };
    let a = a.sqrt() * lerp(-0.125, -0.2, level);

    let mut out = [0.0, 0.0, 0.0, c0[3]];
    for c in 0..3 {
        out[c] = (col[c] + colw[c] * a) / (1.0 + 4.0 * a);
    }
    dst.store(id.0, id.1, out);
}

const ADJUST_LUMA: [f32; 3] = [0.2125, 0.7154, 0.0721];

fn adjust(id: (u32, u32), params: &KernelParams, dst: &mut TargetImage<'_>) {
    if outside(id, params) {
        return;
    }
    let [brightness, contrast, saturation, gamma] = params.values;
    let c1 = dst.load(id.0 as i32, id.1 as i32);

    let mut c2 = [c1[0], c1[1], c1[2]].map(|c| c.powf(1.0 / gamma));
    let luma = luminance(c2, ADJUST_LUMA);
    c2 = c2.map(|c| lerp(luma, c, saturation));
    c2 = c2.map(|c| (c - 0.5) * contrast + 0.5 + brightness);

    dst.store(id.0, id.1, [c2[0], c2[1], c2[2], c1[3]]);
}

fn temperature(id: (u32, u32), params: &KernelParams, dst: &mut TargetImage<'_>) {
    if outside(id, params) {
        return;
    }
    let c1 = dst.load(id.0 as i32, id.1 as i32);
    let out = apply_temperature([c1[0], c1[1], c1[2]], params.values[0]);
    dst.store(id.0, id.1, [out[0], out[1], out[2], c1[3]]);
}

/// Tint by a black body colour while keeping the input value (brightness)
pub fn apply_temperature(c_in: [f32; 3], kelvin: f32) -> [f32; 3] {
    let hsv_in = rgb_to_hsv(c_in);
    let tint = kelvin_to_rgb(kelvin);
    let mult = [tint[0] * c_in[0], tint[1] * c_in[1], tint[2] * c_in[2]];
    let hsv_mult = rgb_to_hsv(mult);
    hsv_to_rgb([hsv_mult[0], hsv_mult[1], hsv_in[2]])
}

pub fn kelvin_to_rgb(kelvin: f32) -> [f32; 3] {
    let t = kelvin / 100.0;
    let tg1 = t - 2.0;
    let tb1 = t - 10.0;
    let tr2 = t - 55.0;
    let tg2 = t - 50.0;

    let step = |edge: f32, x: f32| if x >= edge { 1.0 } else { 0.0 };

    let mut o1 = [
        1.0,
        (-155.254_86 - 0.445_969_5 * tg1 + 104.492_16 * tg1.ln()) / 255.0,
        (-254.769_35 + 0.827_409_6 * tb1 + 115.679_94 * tb1.ln()) / 255.0,
    ];
    o1[2] = lerp(0.0, o1[2], step(2001.0, kelvin));

    let o2 = [
        (351.976_9 + 0.114_206_45 * tr2 - 40.253_662 * tr2.ln()) / 255.0,
        (325.449_4 + 0.079_434_57 * tg2 - 28.085_297 * tg2.ln()) / 255.0,
        1.0,
    ];

    let o1 = o1.map(saturate);
    let o2 = o2.map(saturate);
    let s = step(66.0, t);
    [
        lerp(o1[0], o2[0], s),
        lerp(o1[1], o2[1], s),
        lerp(o1[2], o2[2], s),
    ]
}

pub fn rgb_to_hsv(c: [f32; 3]) -> [f32; 3] {
    let k = [0.0, -1.0 / 3.0, 2.0 / 3.0, -1.0];
    let p = if c[1] < c[2] {
        [c[2], c[1], k[3], k[2]]
    } else {
        [c[1], c[2], k[0], k[1]]
    };
    let q = if c[0] < p[0] {
        [p[0], p[1], p[3], c[0]]
    } else {
        [c[0], p[1], p[2], p[0]]
    };
    let d = q[0] - q[3].min(q[1]);
    let e = 1.0e-10;
    [
        (q[2] + (q[3] - q[1]) / (6.0 * d + e)).abs(),
        d / (q[0] + e),
        q[0],
    ]
}

pub fn hsv_to_rgb(c: [f32; 3]) -> [f32; 3] {
    let k = [1.0, 2.0 / 3.0, 1.0 / 3.0, 3.0];
    let channel = |offset: f32| {
        let p = (fract(c[0] + offset) * 6.0 - k[3]).abs();
        c[2] * lerp(k[0], (p - k[0]).clamp(0.0, 1.0), c[1])
    };
    [channel(k[0]), channel(k[1]), channel(k[2])]
}

fn fract(x: f32) -> f32 {
    x - x.floor()
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Clamp to [0, 1] with NaN going to the upper bound, as GPU min/max do
fn saturate(x: f32) -> f32 {
    x.min(1.0).max(0.0)
}

fn mix(a: Texel, b: Texel, t: f32) -> Texel {
    [
        lerp(a[0], b[0], t),
        lerp(a[1], b[1], t),
        lerp(a[2], b[2], t),
        lerp(a[3], b[3], t),
    ]
}
