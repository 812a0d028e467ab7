/// A hinge activation whose corner is smoothed over `[-δ, δ]`.
///
/// `f(z) = z` for `z >= δ`, `(z + δ)² / 4δ` inside the band and `0` for `z <= -δ`.
/// With `δ = 0` this is the plain rectifier. The function and its derivative are continuous
/// for every `δ > 0`, and `f` is positively homogeneous only when `δ = 0`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SoftHinge {
    delta: f32,
}

impl SoftHinge {
    pub fn new(delta: f32) -> Self {
        Self {
            delta: delta.max(0.),
        }
    }

    pub fn delta(&self) -> f32 {
        self.delta
    }

    pub fn f(&self, z: f32) -> f32 {
        let d = self.delta;
        if z >= d {
            z
        } else if z > -d {
            (z + d).powi(2) / (4. * d)
        } else {
            0.
        }
    }

    pub fn df(&self, z: f32) -> f32 {
        let d = self.delta;
        if z >= d {
            1.
        } else if z > -d {
            (z + d) / (2. * d)
        } else {
            0.
        }
    }

    /// Whether a pre-activation lets gradient through.
    pub fn is_active(&self, z: f32) -> bool {
        self.df(z) > 0.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_rectifier() {
        let act = SoftHinge::new(0.);

        assert_eq!(act.f(2.), 2.);
        assert_eq!(act.f(-2.), 0.);
        assert_eq!(act.df(0.), 1.);
        assert_eq!(act.df(-1e-3), 0.);
    }

    #[test]
    fn smoothed_band_is_continuous() {
        let act = SoftHinge::new(0.5);
        let eps = 1e-4;

        for edge in [-0.5, 0.5] {
            assert!((act.f(edge - eps) - act.f(edge + eps)).abs() < 1e-3);
            assert!((act.df(edge - eps) - act.df(edge + eps)).abs() < 1e-3);
        }
        assert_eq!(act.f(0.), 0.125);
        assert_eq!(act.df(0.), 0.5);
    }

    #[test]
    fn derivative_matches_finite_differences() {
        let act = SoftHinge::new(0.5);
        let h = 1e-3;

        for z in [-0.7, -0.3, 0.1, 0.45, 1.2] {
            let numeric = (act.f(z + h) - act.f(z - h)) / (2. * h);
            assert!((numeric - act.df(z)).abs() < 1e-2, "z = {z}");
        }
    }
}
