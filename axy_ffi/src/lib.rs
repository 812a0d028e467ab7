//! C interface of the fitting core.
//!
//! Every function returns an `INFO` code, `0` on success. Arrays are owned by the caller
//! and stored column-major. Configurations and work buffers are opaque handles created
//! and released through explicit calls.

use std::{
    ffi::{CStr, c_char},
    panic::{self, AssertUnwindSafe},
    slice,
};

use axy::{
    AxyErr, Dataset, Inputs, Model, ModelConfig, ModelDims, RecordEntry, Result, TrainingParams,
    WorkBuffers, check_shape, evaluate, fit_model, init_model, new_fit_config, new_model_config,
    notice_mask,
};
use log::error;
use ndarray::{ShapeBuilder, prelude::*};

/// Returned when a call panicked.
pub const AXY_INTERNAL: i32 = -1;

/// Declared model dimensions, negative values mean absent.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AxyDims {
    pub adn: i64,
    pub mdn: i64,
    pub mdo: i64,
    pub noe: i64,
    pub ane: i64,
    pub ade: i64,
    pub ads: i64,
    pub ans: i64,
    pub ado: i64,
    pub mne: i64,
    pub mde: i64,
    pub mds: i64,
    pub mns: i64,
    pub doe: i64,
    pub noc: i64,
    pub num_threads: i64,
}

/// Sample inputs. `ax`/`axi` hold `na` rows, `x`/`xi` hold `nm` rows.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AxyInputs {
    pub nm: i64,
    pub na: i64,
    pub sizes: *const i64,
    pub ax: *const f32,
    pub axi: *const i64,
    pub axi_cols: i64,
    pub x: *const f32,
    pub xi: *const i64,
    pub xi_cols: i64,
}

/// Inputs plus targets. `yw_cols` is 0, 1 or `mdo`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AxyData {
    pub inputs: AxyInputs,
    pub y: *const f32,
    pub yi: *const i64,
    pub yw: *const f32,
    pub yw_cols: i64,
}

/// Opaque model configuration.
pub struct AxyConfig(ModelConfig);

/// Opaque work buffers of a fit configuration.
pub struct AxyWork(WorkBuffers);

fn invalid(what: &'static str, reason: &str) -> AxyErr {
    AxyErr::Config {
        what,
        reason: reason.to_string(),
    }
}

fn count(what: &'static str, v: i64) -> Result<usize> {
    usize::try_from(v).map_err(|_| invalid(what, "must not be negative"))
}

fn optional(v: i64) -> Option<usize> {
    usize::try_from(v).ok()
}

impl AxyDims {
    fn to_dims(self) -> Result<ModelDims> {
        Ok(ModelDims {
            adn: count("adn", self.adn)?,
            mdn: count("mdn", self.mdn)?,
            mdo: count("mdo", self.mdo)?,
            noe: count("noe", self.noe)?,
            ane: optional(self.ane),
            ade: optional(self.ade),
            ads: optional(self.ads),
            ans: optional(self.ans),
            ado: optional(self.ado),
            mne: optional(self.mne),
            mde: optional(self.mde),
            mds: optional(self.mds),
            mns: optional(self.mns),
            doe: optional(self.doe),
            noc: optional(self.noc),
            num_threads: optional(self.num_threads),
        })
    }
}

/// Runs a call, turning errors and panics into `INFO` codes.
fn guard(f: impl FnOnce() -> Result<()>) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!(info = e.info(); "{e}");
            e.info()
        }
        Err(_) => {
            error!("call panicked");
            AXY_INTERNAL
        }
    }
}

/// # Safety
/// `ptr` must be null or valid for `len` reads.
unsafe fn view<'a, T>(what: &'static str, ptr: *const T, len: usize) -> Result<&'a [T]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(invalid(what, "null pointer"));
    }
    // SAFETY: non null and valid for `len` reads per the caller.
    Ok(unsafe { slice::from_raw_parts(ptr, len) })
}

/// # Safety
/// `ptr` must be null or valid for `len` writes.
unsafe fn view_mut<'a, T>(what: &'static str, ptr: *mut T, len: usize) -> Result<&'a mut [T]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if ptr.is_null() {
        return Err(invalid(what, "null pointer"));
    }
    // SAFETY: non null and valid for `len` writes per the caller.
    Ok(unsafe { slice::from_raw_parts_mut(ptr, len) })
}

/// Copies a column-major `rows × cols` buffer into an owned matrix.
///
/// # Safety
/// `ptr` must be null or valid for `rows * cols` reads.
unsafe fn matrix<T: Clone>(
    what: &'static str,
    ptr: *const T,
    rows: usize,
    cols: usize,
) -> Result<Array2<T>> {
    let data = unsafe { view(what, ptr, rows * cols)? };
    let m = ArrayView2::from_shape((rows, cols).f(), data).map_err(|_| AxyErr::SizeMismatch {
        a: what,
        b: "rows × cols",
        got: data.len(),
        expected: rows * cols,
    })?;
    Ok(m.as_standard_layout().into_owned())
}

/// Writes a matrix into a column-major caller buffer.
///
/// # Safety
/// `ptr` must be null or valid for `m.len()` writes.
unsafe fn store<T: Clone>(what: &'static str, m: ArrayView2<T>, ptr: *mut T) -> Result<()> {
    let out = unsafe { view_mut(what, ptr, m.len())? };
    let mut out = ArrayViewMut2::from_shape(m.dim().f(), out)
        .map_err(|_| invalid(what, "buffer does not match rows × cols"))?;
    out.assign(&m);
    Ok(())
}

/// # Safety
/// `config` must be null or a live handle.
unsafe fn config_ref<'a>(config: *const AxyConfig) -> Result<&'a ModelConfig> {
    // SAFETY: handles are only created by `axy_new_model_config` and `axy_new_fit_config`.
    unsafe { config.as_ref() }
        .map(|c| &c.0)
        .ok_or_else(|| invalid("config", "null handle"))
}

impl AxyInputs {
    /// # Safety
    /// Every pointer must be valid for its documented length.
    unsafe fn to_inputs(&self, config: &ModelConfig) -> Result<Inputs> {
        let dims = config.dims();
        let nm = count("nm", self.nm)?;
        let na = count("na", self.na)?;
        let sizes = unsafe { view("sizes", self.sizes, nm)? }
            .iter()
            .map(|&s| count("sizes", s))
            .collect::<Result<Vec<_>>>()?;
        let axi_cols = count("axi_cols", self.axi_cols)?;
        let xi_cols = count("xi_cols", self.xi_cols)?;

        unsafe {
            Ok(Inputs::new(
                matrix("ax", self.ax, na, dims.adn)?,
                matrix("axi", self.axi, na, axi_cols)?,
                sizes,
                matrix("x", self.x, nm, dims.mdn)?,
                matrix("xi", self.xi, nm, xi_cols)?,
            ))
        }
    }
}

impl AxyData {
    /// # Safety
    /// Every pointer must be valid for its documented length.
    unsafe fn to_dataset(&self, config: &ModelConfig) -> Result<Dataset> {
        let dims = config.dims();
        let inputs = unsafe { self.inputs.to_inputs(config)? };
        let nm = inputs.nm();
        let yw_cols = count("yw_cols", self.yw_cols)?;

        unsafe {
            Ok(Dataset::new(inputs, matrix("y", self.y, nm, dims.mdo)?)
                .with_yi(matrix("yi", self.yi, nm, dims.noc)?)
                .with_yw(matrix("yw", self.yw, nm, yw_cols)?))
        }
    }
}

/// Builds a model configuration.
///
/// # Safety
/// `dims` must be valid, `params_json` null or a NUL terminated string, `out` valid for a write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_new_model_config(
    dims: *const AxyDims,
    params_json: *const c_char,
    out: *mut *mut AxyConfig,
) -> i32 {
    guard(|| {
        let dims = unsafe { dims.as_ref() }
            .ok_or_else(|| invalid("dims", "null pointer"))?
            .to_dims()?;
        let params: TrainingParams = if params_json.is_null() {
            TrainingParams::default()
        } else {
            let text = unsafe { CStr::from_ptr(params_json) }
                .to_str()
                .map_err(|e| invalid("params", &e.to_string()))?;
            serde_json::from_str(text).map_err(|e| invalid("params", &e.to_string()))?
        };
        let out = unsafe { out.as_mut() }.ok_or_else(|| invalid("out", "null pointer"))?;

        let config = new_model_config(&dims, params)?;
        *out = Box::into_raw(Box::new(AxyConfig(config)));
        Ok(())
    })
}

/// Extends a configuration with the sizes of a dataset into a new handle.
///
/// # Safety
/// `config` must be a live handle and `out` valid for a write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_new_fit_config(
    config: *const AxyConfig,
    nm: i64,
    na: i64,
    out: *mut *mut AxyConfig,
) -> i32 {
    guard(|| {
        let config = unsafe { config_ref(config)? };
        let out = unsafe { out.as_mut() }.ok_or_else(|| invalid("out", "null pointer"))?;

        let fit = new_fit_config(config, count("nm", nm)?, count("na", na)?)?;
        *out = Box::into_raw(Box::new(AxyConfig(fit)));
        Ok(())
    })
}

/// Reports the model and work sizes of a configuration, work sizes are `-1` without a fit
/// configuration. Any output pointer may be null.
///
/// # Safety
/// `config` must be a live handle, every non null output valid for a write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_config_sizes(
    config: *const AxyConfig,
    num_vars: *mut i64,
    total_size: *mut i64,
    rwork_size: *mut i64,
    iwork_size: *mut i64,
) -> i32 {
    guard(|| {
        let config = unsafe { config_ref(config)? };
        let (rwork, iwork) = config
            .fit()
            .map_or((-1, -1), |f| (f.rwork_size as i64, f.iwork_size as i64));

        for (ptr, v) in [
            (num_vars, config.num_vars() as i64),
            (total_size, config.total_size() as i64),
            (rwork_size, rwork),
            (iwork_size, iwork),
        ] {
            if let Some(p) = unsafe { ptr.as_mut() } {
                *p = v;
            }
        }
        Ok(())
    })
}

/// Releases a configuration handle, null is ignored.
///
/// # Safety
/// `config` must be null or a handle not released before.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_free_config(config: *mut AxyConfig) {
    if !config.is_null() {
        // SAFETY: created by `Box::into_raw` in this crate.
        drop(unsafe { Box::from_raw(config) });
    }
}

/// Initializes a model into a caller buffer of `total_size` values.
///
/// A negative `seed` draws one from the OS, negative knobs take their defaults.
///
/// # Safety
/// `config` must be a live handle and `model` valid for `model_len` writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_init_model(
    config: *const AxyConfig,
    seed: i64,
    initial_shift_range: f32,
    initial_output_scale: f32,
    model: *mut f32,
    model_len: i64,
) -> i32 {
    guard(|| {
        let config = unsafe { config_ref(config)? };
        let len = count("model_len", model_len)?;
        if len != config.total_size() {
            return Err(AxyErr::SizeMismatch {
                a: "model buffer",
                b: "total_size",
                got: len,
                expected: config.total_size(),
            });
        }
        let out = unsafe { view_mut("model", model, len)? };

        let knob = |v: f32| (v >= 0.).then_some(v);
        let init = init_model(
            config,
            u64::try_from(seed).ok(),
            knob(initial_shift_range),
            knob(initial_output_scale),
        )?;
        out.copy_from_slice(init.as_slice());
        Ok(())
    })
}

/// Checks a dataset against a configuration and model.
///
/// # Safety
/// `config` must be a live handle, `model` valid for `total_size` reads and `data` valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_check_shape(
    config: *const AxyConfig,
    model: *const f32,
    data: *const AxyData,
) -> i32 {
    guard(|| {
        let config = unsafe { config_ref(config)? };
        let model = Model::from_vec(unsafe { view("model", model, config.total_size())? }.to_vec());
        let data = unsafe { data.as_ref() }.ok_or_else(|| invalid("data", "null pointer"))?;
        let data = unsafe { data.to_dataset(config)? };
        check_shape(config, &model, &data)
    })
}

/// Allocates the work buffers of a fit configuration.
///
/// # Safety
/// `config` must be a live handle and `out` valid for a write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_new_work(config: *const AxyConfig, out: *mut *mut AxyWork) -> i32 {
    guard(|| {
        let config = unsafe { config_ref(config)? };
        let out = unsafe { out.as_mut() }.ok_or_else(|| invalid("out", "null pointer"))?;
        *out = Box::into_raw(Box::new(AxyWork(WorkBuffers::new(config)?)));
        Ok(())
    })
}

/// Releases work buffers, null is ignored.
///
/// # Safety
/// `work` must be null or a handle not released before.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_free_work(work: *mut AxyWork) {
    if !work.is_null() {
        // SAFETY: created by `Box::into_raw` in this crate.
        drop(unsafe { Box::from_raw(work) });
    }
}

/// Fits the model in place.
///
/// The model buffer is written back even when the fit fails, it then holds the last
/// accepted step the work buffers continue from.
///
/// When `record` is not null it receives a column-major `steps × 6` history, rows past the
/// steps actually run are left untouched. Any output pointer may be null.
///
/// # Safety
/// `config` and `work` must be live handles, `model` valid for `total_size` reads and
/// writes, `data` valid and `record` null or valid for `steps * 6` writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_fit_model(
    config: *const AxyConfig,
    model: *mut f32,
    work: *mut AxyWork,
    data: *const AxyData,
    steps: i64,
    continuing: i32,
    record: *mut f32,
    steps_run: *mut i64,
    sse: *mut f64,
    notices: *mut u32,
) -> i32 {
    guard(|| {
        let config = unsafe { config_ref(config)? };
        let params = unsafe { view_mut("model", model, config.total_size())? };
        let work = unsafe { work.as_mut() }.ok_or_else(|| invalid("work", "null handle"))?;
        let data = unsafe { data.as_ref() }.ok_or_else(|| invalid("data", "null pointer"))?;
        let data = unsafe { data.to_dataset(config)? };
        let steps = count("steps", steps)?;

        let mut fitted = Model::from_vec(params.to_vec());
        let result = fit_model(
            config,
            &mut fitted,
            &mut work.0,
            &data,
            steps,
            !record.is_null(),
            continuing != 0,
        );
        // The work state tracks `fitted` even when the fit fails part way.
        params.copy_from_slice(fitted.as_slice());
        let outcome = result?;

        if let Some(history) = outcome.record.as_ref().filter(|_| !record.is_null()) {
            let out = unsafe { view_mut("record", record, steps * RecordEntry::WIDTH)? };
            let mut table = ArrayViewMut2::from_shape((steps, RecordEntry::WIDTH).f(), out)
                .map_err(|_| invalid("record", "buffer does not match steps × 6"))?;
            for (mut row, entry) in table.rows_mut().into_iter().zip(&history.steps) {
                row.assign(&aview1(&entry.to_array()));
            }
        }
        if let Some(p) = unsafe { steps_run.as_mut() } {
            *p = outcome.steps_run as i64;
        }
        if let Some(p) = unsafe { sse.as_mut() } {
            *p = outcome.sse;
        }
        if let Some(p) = unsafe { notices.as_mut() } {
            *p = notice_mask(&outcome.notices);
        }
        Ok(())
    })
}

/// Evaluates a model, writing `nm × mdo` numeric and `nm × noc` categorical outputs.
///
/// # Safety
/// `config` must be a live handle, `model` valid for `total_size` reads, `inputs` valid and
/// both outputs valid for their writes, either may be null when its width is zero.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn axy_evaluate(
    config: *const AxyConfig,
    model: *const f32,
    inputs: *const AxyInputs,
    y: *mut f32,
    yi: *mut i64,
) -> i32 {
    guard(|| {
        let config = unsafe { config_ref(config)? };
        let model = Model::from_vec(unsafe { view("model", model, config.total_size())? }.to_vec());
        let inputs = unsafe { inputs.as_ref() }.ok_or_else(|| invalid("inputs", "null pointer"))?;
        let inputs = unsafe { inputs.to_inputs(config)? };

        let predictions = evaluate(config, &model, &inputs)?;
        unsafe {
            store("y", predictions.y.view(), y)?;
            store("yi", predictions.yi.view(), yi)?;
        }
        Ok(())
    })
}

