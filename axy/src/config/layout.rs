use std::ops::Range;

use super::Dims;

/// Offsets of one piecewise linear network inside the flat parameter vector.
///
/// Internal layer `l` maps its input through `x·W + s` followed by the hinge activation,
/// the output layer is a plain product with no shift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetLayout {
    pub input: usize,
    pub state: usize,
    pub layers: usize,
    pub output: usize,

    pub in_w: Range<usize>,
    pub in_s: Range<usize>,
    pub st_w: Range<usize>,
    pub st_s: Range<usize>,
    pub out_w: Range<usize>,
}

impl NetLayout {
    fn new(cursor: &mut Cursor, input: usize, state: usize, layers: usize, output: usize) -> Self {
        let (in_w, in_s, st_w, st_s) = if layers == 0 {
            let at = cursor.at();
            (at..at, at..at, at..at, at..at)
        } else {
            (
                cursor.take(input * state),
                cursor.take(state),
                cursor.take((layers - 1) * state * state),
                cursor.take((layers - 1) * state),
            )
        };
        let last = if layers == 0 { input } else { state };
        let out_w = cursor.take(last * output);

        Self {
            input,
            state,
            layers,
            output,
            in_w,
            in_s,
            st_w,
            st_s,
            out_w,
        }
    }

    /// Width of the values entering internal layer `l`, or the output layer when `l == layers`.
    pub fn width_into(&self, l: usize) -> usize {
        if l == 0 { self.input } else { self.state }
    }

    /// The weight range of internal layer `l`, shaped `width_into(l) × state`.
    pub fn layer_weights(&self, l: usize) -> Range<usize> {
        if l == 0 {
            self.in_w.clone()
        } else {
            let size = self.state * self.state;
            let start = self.st_w.start + (l - 1) * size;
            start..start + size
        }
    }

    /// The shift range of internal layer `l`.
    pub fn layer_shifts(&self, l: usize) -> Range<usize> {
        if l == 0 {
            self.in_s.clone()
        } else {
            let start = self.st_s.start + (l - 1) * self.state;
            start..start + self.state
        }
    }

    /// The weight block reading the network's inputs, shaped `input × cols`, and `cols`.
    pub fn input_weights(&self) -> (Range<usize>, usize) {
        if self.layers == 0 {
            (self.out_w.clone(), self.output)
        } else {
            (self.in_w.clone(), self.state)
        }
    }

    /// Number of internal neurons.
    pub fn neurons(&self) -> usize {
        self.layers * self.state
    }

    /// The whole span of this network's parameters.
    pub fn span(&self) -> Range<usize> {
        self.in_w.start..self.out_w.end
    }
}

struct Cursor(usize);

impl Cursor {
    fn at(&self) -> usize {
        self.0
    }

    fn take(&mut self, n: usize) -> Range<usize> {
        let start = self.0;
        self.0 += n;
        start..self.0
    }
}

/// The offset table of a whole model.
///
/// Trainable values come first and end at `num_vars`, the normalization block follows
/// and ends at `total_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLayout {
    pub a_emb: Range<usize>,
    pub agg: NetLayout,
    pub m_emb: Range<usize>,
    pub main: NetLayout,
    pub o_emb: Range<usize>,

    pub ax_shift: Range<usize>,
    pub ax_rescale: Range<usize>,
    pub ay_shift: Range<usize>,
    pub ay_rescale: Range<usize>,
    pub x_shift: Range<usize>,
    pub x_rescale: Range<usize>,
    pub y_shift: Range<usize>,
    pub y_rescale: Range<usize>,

    pub num_vars: usize,
    pub total_size: usize,
}

impl ModelLayout {
    /// Computes every offset for the given dimensions.
    pub fn new(dims: &Dims) -> Self {
        let mut cursor = Cursor(0);

        let a_emb = cursor.take(dims.ane * dims.ade);
        let agg = NetLayout::new(&mut cursor, dims.adi, dims.ads, dims.ans, dims.ado);
        let m_emb = cursor.take(dims.mne * dims.mde);
        let main = NetLayout::new(&mut cursor, dims.mdi, dims.mds, dims.mns, dims.mo);
        let o_emb = cursor.take(dims.noe * dims.doe);
        let num_vars = cursor.at();

        let ax_shift = cursor.take(dims.adn);
        let ax_rescale = cursor.take(dims.adn);
        let ay_shift = cursor.take(dims.ado);
        let ay_rescale = cursor.take(dims.ado);
        let x_shift = cursor.take(dims.mdn);
        let x_rescale = cursor.take(dims.mdn);
        let y_shift = cursor.take(dims.mdo);
        let y_rescale = cursor.take(dims.mdo);
        let total_size = cursor.at();

        Self {
            a_emb,
            agg,
            m_emb,
            main,
            o_emb,
            ax_shift,
            ax_rescale,
            ay_shift,
            ay_rescale,
            x_shift,
            x_rescale,
            y_shift,
            y_rescale,
            num_vars,
            total_size,
        }
    }

    /// Every named block in storage order.
    pub fn blocks(&self) -> Vec<(&'static str, Range<usize>)> {
        vec![
            ("a_emb", self.a_emb.clone()),
            ("a_in_w", self.agg.in_w.clone()),
            ("a_in_s", self.agg.in_s.clone()),
            ("a_state_w", self.agg.st_w.clone()),
            ("a_state_s", self.agg.st_s.clone()),
            ("a_out_w", self.agg.out_w.clone()),
            ("m_emb", self.m_emb.clone()),
            ("m_in_w", self.main.in_w.clone()),
            ("m_in_s", self.main.in_s.clone()),
            ("m_state_w", self.main.st_w.clone()),
            ("m_state_s", self.main.st_s.clone()),
            ("m_out_w", self.main.out_w.clone()),
            ("o_emb", self.o_emb.clone()),
            ("ax_shift", self.ax_shift.clone()),
            ("ax_rescale", self.ax_rescale.clone()),
            ("ay_shift", self.ay_shift.clone()),
            ("ay_rescale", self.ay_rescale.clone()),
            ("x_shift", self.x_shift.clone()),
            ("x_rescale", self.x_rescale.clone()),
            ("y_shift", self.y_shift.clone()),
            ("y_rescale", self.y_rescale.clone()),
        ]
    }

    /// The embedding table ranges with their entry widths, in storage order.
    pub fn embedding_tables(&self, dims: &Dims) -> [(Range<usize>, usize); 3] {
        [
            (self.a_emb.clone(), dims.ade),
            (self.m_emb.clone(), dims.mde),
            (self.o_emb.clone(), dims.doe),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelDims;

    fn assert_tiles(layout: &ModelLayout) {
        let mut at = 0;
        for (name, range) in layout.blocks() {
            assert_eq!(range.start, at, "block {name} leaves a gap or overlaps");
            assert!(range.end >= range.start);
            at = range.end;
        }
        assert_eq!(at, layout.total_size);
        assert_eq!(layout.o_emb.end, layout.num_vars);
    }

    #[test]
    fn layers_are_addressed_inside_their_blocks() {
        let dims = ModelDims {
            adn: 2,
            mdn: 3,
            mdo: 1,
            ads: Some(4),
            ans: Some(3),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let layout = ModelLayout::new(&dims);
        let agg = &layout.agg;

        assert_eq!(agg.layer_weights(0), agg.in_w);
        assert_eq!(agg.layer_weights(1).start, agg.st_w.start);
        assert_eq!(agg.layer_weights(2).end, agg.st_w.end);
        assert_eq!(agg.layer_shifts(2).end, agg.st_s.end);
        assert_eq!(agg.out_w.len(), 4 * dims.ado);
        assert_tiles(&layout);
    }

    #[test]
    fn linear_networks_have_only_output_weights() {
        let dims = ModelDims {
            mdn: 3,
            mdo: 2,
            mns: Some(0),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let layout = ModelLayout::new(&dims);

        assert!(layout.main.in_w.is_empty());
        assert_eq!(layout.main.out_w.len(), 6);
        assert_eq!(layout.num_vars, 6);
        assert_tiles(&layout);
    }

    #[test]
    fn many_shapes_tile() {
        for adn in 0..3 {
            for ane in [0, 1, 5] {
                for mns in [0, 1, 3] {
                    for noe in [0, 3] {
                        let dims = ModelDims {
                            adn,
                            mdn: 1,
                            mdo: 1,
                            noe,
                            ane: Some(ane),
                            mne: Some(2),
                            ads: Some(3),
                            mds: Some(5),
                            mns: Some(mns),
                            ..Default::default()
                        }
                        .resolve()
                        .unwrap();
                        let layout = ModelLayout::new(&dims);
                        assert!(layout.total_size > 0);
                        assert_tiles(&layout);
                    }
                }
            }
        }
    }
}
