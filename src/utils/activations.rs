//! Activation functions fused into normalization layers
//!
//! Every activation takes two shape parameters `alpha` and `beta`. A caller
//! passing 0 for either gets the variant's default. The variant is resolved
//! once into a pair of plain function pointers (`f` and its derivative `df`),
//! so the per-element loops never branch on the activation kind.

use serde::{Deserialize, Serialize};

/// Closed set of activations available to fused normalization layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// `alpha * x + beta`
    Linear,
    Relu,
    /// ReLU clipped at `alpha`
    BoundedRelu,
    Elu,
    Logistic,
    /// `clamp(alpha * x + beta, 0, 1)`
    HardLogistic,
    /// `x * clamp(alpha * x + beta, 0, 1)`
    HardSwish,
    /// `x * sigmoid(alpha * x)`
    Swish,
    Mish,
    TanhExp,
    Tanh,
    /// `ln(1 + exp(beta * x)) / beta`, linear above the `alpha` threshold
    SoftPlus,
    Abs,
    Square,
    /// tanh approximation
    Gelu,
    ASinh,
    /// `clamp(x, alpha, beta)`
    Clip,
    Exp,
    /// natural logarithm, defined for `x > 0`
    Log,
    /// `ln(1 + exp(x))`
    SoftRelu,
    /// `x / (1 + |x|)`
    SoftSign,
    /// defined for `x >= 0`
    Sqrt,
}

type Kernel = fn(f32, f32, f32) -> f32;

/// An activation with its parameters fixed and its kernels selected.
#[derive(Debug, Clone, Copy)]
pub struct ActivationFn {
    kind: Activation,
    alpha: f32,
    beta: f32,
    f: Kernel,
    df: Kernel,
}

impl ActivationFn {
    pub fn kind(&self) -> Activation {
        self.kind
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn beta(&self) -> f32 {
        self.beta
    }

    #[inline]
    pub fn forward(&self, x: f32) -> f32 {
        (self.f)(x, self.alpha, self.beta)
    }

    /// Derivative with respect to the pre-activation value `x`.
    #[inline]
    pub fn derivative(&self, x: f32) -> f32 {
        (self.df)(x, self.alpha, self.beta)
    }
}

impl Activation {
    /// Alpha used when the caller passes 0.
    pub fn default_alpha(self) -> f32 {
        match self {
            Activation::BoundedRelu => 6.0,
            Activation::Elu | Activation::Linear | Activation::Swish => 1.0,
            Activation::SoftPlus => 20.0,
            Activation::HardLogistic => 0.2,
            Activation::HardSwish => 1.0 / 6.0,
            _ => 0.0,
        }
    }

    /// Beta used when the caller passes 0.
    pub fn default_beta(self) -> f32 {
        match self {
            Activation::HardLogistic | Activation::HardSwish => 0.5,
            Activation::SoftPlus => 1.0,
            _ => 0.0,
        }
    }

    /// Substitutes defaults for unset (zero) parameters and selects the kernels.
    pub fn resolve(self, alpha: f32, beta: f32) -> ActivationFn {
        let alpha = if alpha == 0.0 { self.default_alpha() } else { alpha };
        let beta = match self {
            // clipping threshold is alpha alone
            Activation::BoundedRelu => 0.0,
            _ if beta == 0.0 => self.default_beta(),
            _ => beta,
        };
        let (f, df): (Kernel, Kernel) = match self {
            Activation::Linear => (linear, linear_df),
            Activation::Relu => (relu, relu_df),
            Activation::BoundedRelu => (bounded_relu, bounded_relu_df),
            Activation::Elu => (elu, elu_df),
            Activation::Logistic => (logistic, logistic_df),
            Activation::HardLogistic => (hard_logistic, hard_logistic_df),
            Activation::HardSwish => (hard_swish, hard_swish_df),
            Activation::Swish => (swish, swish_df),
            Activation::Mish => (mish, mish_df),
            Activation::TanhExp => (tanh_exp, tanh_exp_df),
            Activation::Tanh => (tanh, tanh_df),
            Activation::SoftPlus => (soft_plus, soft_plus_df),
            Activation::Abs => (abs, abs_df),
            Activation::Square => (square, square_df),
            Activation::Gelu => (gelu, gelu_df),
            Activation::ASinh => (asinh, asinh_df),
            Activation::Clip => (clip, clip_df),
            Activation::Exp => (exp, exp_df),
            Activation::Log => (log, log_df),
            Activation::SoftRelu => (soft_relu, soft_relu_df),
            Activation::SoftSign => (soft_sign, soft_sign_df),
            Activation::Sqrt => (sqrt, sqrt_df),
        };
        ActivationFn {
            kind: self,
            alpha,
            beta,
            f,
            df,
        }
    }

    /// Lower-case name used in descriptions and configuration files.
    pub fn name(self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::BoundedRelu => "bounded_relu",
            Activation::Elu => "elu",
            Activation::Logistic => "logistic",
            Activation::HardLogistic => "hard_logistic",
            Activation::HardSwish => "hard_swish",
            Activation::Swish => "swish",
            Activation::Mish => "mish",
            Activation::TanhExp => "tanh_exp",
            Activation::Tanh => "tanh",
            Activation::SoftPlus => "soft_plus",
            Activation::Abs => "abs",
            Activation::Square => "square",
            Activation::Gelu => "gelu",
            Activation::ASinh => "asinh",
            Activation::Clip => "clip",
            Activation::Exp => "exp",
            Activation::Log => "log",
            Activation::SoftRelu => "soft_relu",
            Activation::SoftSign => "soft_sign",
            Activation::Sqrt => "sqrt",
        }
    }

    pub const ALL: [Activation; 22] = [
        Activation::Linear,
        Activation::Relu,
        Activation::BoundedRelu,
        Activation::Elu,
        Activation::Logistic,
        Activation::HardLogistic,
        Activation::HardSwish,
        Activation::Swish,
        Activation::Mish,
        Activation::TanhExp,
        Activation::Tanh,
        Activation::SoftPlus,
        Activation::Abs,
        Activation::Square,
        Activation::Gelu,
        Activation::ASinh,
        Activation::Clip,
        Activation::Exp,
        Activation::Log,
        Activation::SoftRelu,
        Activation::SoftSign,
        Activation::Sqrt,
    ];
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn linear(x: f32, a: f32, b: f32) -> f32 {
    a * x + b
}

fn linear_df(_x: f32, a: f32, _b: f32) -> f32 {
    a
}

fn relu(x: f32, _a: f32, _b: f32) -> f32 {
    x.max(0.0)
}

fn relu_df(x: f32, _a: f32, _b: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

fn bounded_relu(x: f32, a: f32, _b: f32) -> f32 {
    x.max(0.0).min(a)
}

fn bounded_relu_df(x: f32, a: f32, _b: f32) -> f32 {
    if x > 0.0 && x <= a {
        1.0
    } else {
        0.0
    }
}

fn elu(x: f32, a: f32, _b: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        a * (x.exp() - 1.0)
    }
}

fn elu_df(x: f32, a: f32, _b: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        a * x.exp()
    }
}

fn logistic(x: f32, _a: f32, _b: f32) -> f32 {
    sigmoid(x)
}

fn logistic_df(x: f32, _a: f32, _b: f32) -> f32 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

fn hard_logistic(x: f32, a: f32, b: f32) -> f32 {
    (a * x + b).clamp(0.0, 1.0)
}

fn hard_logistic_df(x: f32, a: f32, b: f32) -> f32 {
    let t = a * x + b;
    if t > 0.0 && t < 1.0 {
        a
    } else {
        0.0
    }
}

fn hard_swish(x: f32, a: f32, b: f32) -> f32 {
    x * (a * x + b).clamp(0.0, 1.0)
}

fn hard_swish_df(x: f32, a: f32, b: f32) -> f32 {
    let t = a * x + b;
    if t <= 0.0 {
        0.0
    } else if t >= 1.0 {
        1.0
    } else {
        2.0 * a * x + b
    }
}

fn swish(x: f32, a: f32, _b: f32) -> f32 {
    x * sigmoid(a * x)
}

fn swish_df(x: f32, a: f32, _b: f32) -> f32 {
    let s = sigmoid(a * x);
    s + a * x * s * (1.0 - s)
}

fn mish(x: f32, _a: f32, _b: f32) -> f32 {
    x * x.exp().ln_1p().tanh()
}

fn mish_df(x: f32, _a: f32, _b: f32) -> f32 {
    let t = x.exp().ln_1p().tanh();
    t + x * (1.0 - t * t) * sigmoid(x)
}

fn tanh_exp(x: f32, _a: f32, _b: f32) -> f32 {
    x * x.exp().tanh()
}

// tanh(e^x) saturates to exactly 1 long before e^x overflows
const TANH_EXP_SATURATION: f32 = 20.0;

fn tanh_exp_df(x: f32, _a: f32, _b: f32) -> f32 {
    if x > TANH_EXP_SATURATION {
        return 1.0;
    }
    let e = x.exp();
    let t = e.tanh();
    t + x * e * (1.0 - t * t)
}

fn tanh(x: f32, _a: f32, _b: f32) -> f32 {
    x.tanh()
}

fn tanh_df(x: f32, _a: f32, _b: f32) -> f32 {
    let t = x.tanh();
    1.0 - t * t
}

fn soft_plus(x: f32, a: f32, b: f32) -> f32 {
    let bx = b * x;
    if bx > a {
        x
    } else {
        bx.exp().ln_1p() / b
    }
}

fn soft_plus_df(x: f32, a: f32, b: f32) -> f32 {
    let bx = b * x;
    if bx > a {
        1.0
    } else {
        sigmoid(bx)
    }
}

fn abs(x: f32, _a: f32, _b: f32) -> f32 {
    x.abs()
}

fn abs_df(x: f32, _a: f32, _b: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn square(x: f32, _a: f32, _b: f32) -> f32 {
    x * x
}

fn square_df(x: f32, _a: f32, _b: f32) -> f32 {
    2.0 * x
}

const GELU_K: f32 = 0.797_884_6; // sqrt(2 / pi)
const GELU_C: f32 = 0.044_715;

fn gelu(x: f32, _a: f32, _b: f32) -> f32 {
    0.5 * x * (1.0 + (GELU_K * (x + GELU_C * x * x * x)).tanh())
}

fn gelu_df(x: f32, _a: f32, _b: f32) -> f32 {
    let inner = GELU_K * (x + GELU_C * x * x * x);
    if inner.abs() > TANH_EXP_SATURATION {
        return if inner > 0.0 { 1.0 } else { 0.0 };
    }
    let t = inner.tanh();
    let d_inner = GELU_K * (1.0 + 3.0 * GELU_C * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
}

fn asinh(x: f32, _a: f32, _b: f32) -> f32 {
    x.asinh()
}

fn asinh_df(x: f32, _a: f32, _b: f32) -> f32 {
    1.0 / (x * x + 1.0).sqrt()
}

fn clip(x: f32, a: f32, b: f32) -> f32 {
    x.max(a).min(b)
}

fn clip_df(x: f32, a: f32, b: f32) -> f32 {
    if x > a && x <= b {
        1.0
    } else {
        0.0
    }
}

fn exp(x: f32, _a: f32, _b: f32) -> f32 {
    x.exp()
}

fn exp_df(x: f32, _a: f32, _b: f32) -> f32 {
    x.exp()
}

fn log(x: f32, _a: f32, _b: f32) -> f32 {
    x.ln()
}

fn log_df(x: f32, _a: f32, _b: f32) -> f32 {
    1.0 / x
}

fn soft_relu(x: f32, _a: f32, _b: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn soft_relu_df(x: f32, _a: f32, _b: f32) -> f32 {
    sigmoid(x)
}

fn soft_sign(x: f32, _a: f32, _b: f32) -> f32 {
    x / (1.0 + x.abs())
}

fn soft_sign_df(x: f32, _a: f32, _b: f32) -> f32 {
    let d = 1.0 + x.abs();
    1.0 / (d * d)
}

fn sqrt(x: f32, _a: f32, _b: f32) -> f32 {
    x.sqrt()
}

fn sqrt_df(x: f32, _a: f32, _b: f32) -> f32 {
    0.5 / x.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn test_defaults_substituted_only_for_zero() {
        let hs = Activation::HardSwish.resolve(0.0, 0.0);
        assert!((hs.alpha() - 1.0 / 6.0).abs() < EPSILON);
        assert_eq!(hs.beta(), 0.5);

        let custom = Activation::HardSwish.resolve(0.25, 0.4);
        assert_eq!(custom.alpha(), 0.25);
        assert_eq!(custom.beta(), 0.4);

        let sp = Activation::SoftPlus.resolve(0.0, 0.0);
        assert_eq!(sp.alpha(), 20.0);
        assert_eq!(sp.beta(), 1.0);

        let elu = Activation::Elu.resolve(0.0, 0.0);
        assert_eq!(elu.alpha(), 1.0);

        let hl = Activation::HardLogistic.resolve(0.0, 0.0);
        assert_eq!(hl.alpha(), 0.2);
        assert_eq!(hl.beta(), 0.5);
    }

    #[test]
    fn test_bounded_relu_beta_forced_zero() {
        let br = Activation::BoundedRelu.resolve(0.0, 3.0);
        assert_eq!(br.alpha(), 6.0);
        assert_eq!(br.beta(), 0.0);
        assert_eq!(br.forward(10.0), 6.0);
        assert_eq!(br.forward(-1.0), 0.0);
        assert_eq!(br.forward(2.5), 2.5);
    }

    #[test]
    fn test_relu_forward_and_derivative() {
        let relu = Activation::Relu.resolve(0.0, 0.0);
        assert_eq!(relu.forward(-2.0), 0.0);
        assert_eq!(relu.forward(3.0), 3.0);
        assert_eq!(relu.derivative(-2.0), 0.0);
        assert_eq!(relu.derivative(3.0), 1.0);
    }

    #[test]
    fn test_linear_default_is_identity() {
        let linear = Activation::Linear.resolve(0.0, 0.0);
        for &x in &[-3.0f32, 0.0, 1.5] {
            assert_eq!(linear.forward(x), x);
            assert_eq!(linear.derivative(x), 1.0);
        }
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        let h = 1e-2f32;
        let points = [-2.3f32, -0.7, 0.4, 1.9];
        for kind in Activation::ALL {
            let act = kind.resolve(0.0, 0.0);
            let positive_only = matches!(kind, Activation::Log | Activation::Sqrt);
            for &x in points.iter().filter(|x| !positive_only || **x > h) {
                let numeric = (act.forward(x + h) - act.forward(x - h)) / (2.0 * h);
                let analytic = act.derivative(x);
                assert!(
                    (numeric - analytic).abs() < 2e-2,
                    "{} at {}: numeric {} analytic {}",
                    kind.name(),
                    x,
                    numeric,
                    analytic
                );
            }
        }
    }

    #[test]
    fn test_derivatives_finite_at_large_inputs() {
        for kind in Activation::ALL {
            if matches!(kind, Activation::Exp | Activation::Square) {
                continue;
            }
            let act = kind.resolve(0.0, 0.0);
            for &x in &[90.0f32, 1.0e4, 1.0e13] {
                let d = act.derivative(x);
                assert!(d.is_finite(), "{} at {}: derivative {}", kind.name(), x, d);
            }
        }
        let tanh_exp = Activation::TanhExp.resolve(0.0, 0.0);
        assert_eq!(tanh_exp.forward(90.0), 90.0);
        assert_eq!(tanh_exp.derivative(90.0), 1.0);
        assert_eq!(Activation::Gelu.resolve(0.0, 0.0).derivative(-1.0e13), 0.0);
    }

    #[test]
    fn test_clip_uses_alpha_and_beta_as_bounds() {
        let clip = Activation::Clip.resolve(-1.0, 2.0);
        assert_eq!(clip.forward(-3.0), -1.0);
        assert_eq!(clip.forward(0.5), 0.5);
        assert_eq!(clip.forward(5.0), 2.0);
        assert_eq!(clip.derivative(-3.0), 0.0);
        assert_eq!(clip.derivative(0.5), 1.0);
        assert_eq!(clip.derivative(2.0), 1.0);
        assert_eq!(clip.derivative(5.0), 0.0);
    }

    #[test]
    fn test_smooth_rectifiers() {
        let soft_relu = Activation::SoftRelu.resolve(0.0, 0.0);
        assert!((soft_relu.forward(0.0) - std::f32::consts::LN_2).abs() < EPSILON);
        assert_eq!(soft_relu.forward(200.0), 200.0);
        assert_eq!(soft_relu.forward(-200.0), 0.0);

        let soft_sign = Activation::SoftSign.resolve(0.0, 0.0);
        assert_eq!(soft_sign.forward(3.0), 0.75);
        assert_eq!(soft_sign.derivative(-1.0), 0.25);
    }

    #[test]
    fn test_serde_names() {
        let kind: Activation = serde_json::from_str("\"hard_swish\"").unwrap();
        assert_eq!(kind, Activation::HardSwish);
        assert_eq!(kind.name(), "hard_swish");
    }
}
