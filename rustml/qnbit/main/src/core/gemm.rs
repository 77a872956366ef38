//! Batch GEMM driver over a kernel table.
//!
//! `C = A * B (+ bias)` with row-major A and C and block-quantized B that was
//! packed by [`QnbitGemm::pack_quant_b_data`] for the same compute type. The
//! driver validates shapes, carves the int8 workspace, picks the kernel
//! variant from the table's bound slots and tiles the work over rayon.

use std::time::Instant;

use half::f16;
use rayon::prelude::*;

use crate::api::error::{QnbitError, QnbitResult};
use crate::api::traits::{
    HQ4BitBlkDequantBForHgemmCompFp16Fn, HQ4BitGemmKernelCompFp16Fn, QnbitKernels, QuantizeARowComputeBlkSumCompInt8Fn,
    SQNBitGemmKernelBlkSumCompInt8Fn,
};
use crate::api::types::{
    BitWidth, Capability, ComputeType, PackedQuantBRef, PackedQuantBShape, QuantABlkSum, QuantBColumns,
    QuantScheme, MAX_BLK_LEN,
};
use crate::core::dispatch::{dispatch_for, qnbit_dispatch};
use crate::core::kernels::fp32::sgemm_panel16;
use crate::core::layout::{self, BLK_SUM_PANEL_N};
use crate::core::packed::PackedQuantBLayout;
use crate::core::runtime::gemm_par_threshold;
use crate::core::workspace::{self, WorkspaceLayout};

/// Shape and quantization of one GEMM (or every GEMM of a batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QnbitGemmParams {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub scheme: QuantScheme,
    pub compute_type: ComputeType,
}

impl QnbitGemmParams {
    #[inline]
    pub fn block_count_k(&self) -> usize {
        self.scheme.block_count_k(self.k)
    }

    fn is_empty(&self) -> bool {
        self.m == 0 || self.n == 0 || self.k == 0
    }
}

/// Operands of one GEMM.
#[derive(Debug)]
pub struct GemmDataParams<'a, T> {
    /// Row-major A, `m` rows of stride `lda`.
    pub a: &'a [T],
    pub lda: usize,
    /// Buffer filled by `pack_quant_b_data`, at the address it was packed at.
    pub packed_b: &'a [u8],
    /// Column-major block scales. The int8 paths read the copy inside
    /// `packed_b` instead.
    pub scale: &'a [T],
    /// Column-major zero points when the scheme has them.
    pub zero_point: Option<&'a [u8]>,
    pub bias: Option<&'a [T]>,
    /// Row-major C, `m` rows of stride `ldc`.
    pub c: &'a mut [T],
    pub ldc: usize,
}

/// Whether `kernels` can run the given variant.
pub fn is_qnbit_gemm_available(
    kernels: &dyn QnbitKernels,
    bit_width: BitWidth,
    blk_len: usize,
    compute_type: ComputeType,
) -> bool {
    if QuantScheme::validate_blk_len(blk_len).is_err() {
        return false;
    }
    match (bit_width, compute_type) {
        (BitWidth::Four, ComputeType::Fp32) => {
            kernels.q4bit_gemm_pack_quant_b_data_size().is_some()
                && kernels.sq4bit_gemm_pack_quant_b_data().is_some()
                && kernels.sq4bit_gemm_m1_kernel_comp_fp32().is_some()
                && kernels.sq4bit_blk_dequant_b_for_sgemm_comp_fp32().is_some()
        }
        (BitWidth::Four, ComputeType::Fp16) => {
            kernels.q4bit_gemm_pack_quant_b_data_size().is_some()
                && kernels.hq4bit_gemm_pack_quant_b_data().is_some()
                && kernels.hq4bit_blk_dequant_b_for_hgemm_comp_fp16().is_some()
                && kernels.hq4bit_gemm_kernel_comp_fp16().is_some()
        }
        (BitWidth::Four, ComputeType::Int8) => {
            let packed = kernels.sq4bit_gemm_kernel_packed_comp_int8().is_some()
                && kernels.quantize_a_packed_comp_int8().is_some();
            let blk_sum = kernels.sq4bit_gemm_kernel_blk_sum_comp_int8().is_some()
                && kernels.quantize_a_row_compute_blk_sum_comp_int8().is_some();
            let rows = kernels.sq4bit_gemm_kernel_comp_int8().is_some()
                && kernels.quantize_a_row_comp_int8().is_some();
            has_int8_plumbing(kernels)
                && kernels.q4bit_gemm_pack_quant_b_data_size().is_some()
                && kernels.sq4bit_gemm_pack_quant_b_data_and_blk_sum().is_some()
                && (packed || blk_sum || rows)
        }
        (BitWidth::Eight, ComputeType::Int8) => {
            has_int8_plumbing(kernels)
                && kernels.q8bit_gemm_pack_quant_b_data_size().is_some()
                && kernels.sq8bit_gemm_pack_quant_b_data_and_blk_sum().is_some()
                && kernels.sq8bit_gemm_kernel_blk_sum_comp_int8().is_some()
                && kernels.quantize_a_row_compute_blk_sum_comp_int8().is_some()
        }
        (BitWidth::Eight, ComputeType::Fp32 | ComputeType::Fp16) => false,
    }
}

fn has_int8_plumbing(kernels: &dyn QnbitKernels) -> bool {
    kernels.per_gemm_workspace_size().is_some() && kernels.per_gemm_workspace_alignment().is_some()
}

/// Block-quantized GEMM bound to one kernel table.
#[derive(Clone, Copy)]
pub struct QnbitGemm {
    kernels: &'static dyn QnbitKernels,
}

impl std::fmt::Debug for QnbitGemm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QnbitGemm").field("kernels", &self.kernels.name()).finish()
    }
}

impl Default for QnbitGemm {
    fn default() -> Self {
        Self::new()
    }
}

impl QnbitGemm {
    /// Uses the host's dispatch table.
    pub fn new() -> Self {
        Self { kernels: qnbit_dispatch() }
    }

    /// Uses the table for `capability`; fails if the host cannot run it.
    pub fn with_capability(capability: Capability) -> QnbitResult<Self> {
        dispatch_for(capability)
            .map(Self::with_kernels)
            .ok_or_else(|| QnbitError::unsupported(format!("{} kernels on this host", capability)))
    }

    pub fn with_kernels(kernels: &'static dyn QnbitKernels) -> Self {
        Self { kernels }
    }

    pub fn kernels(&self) -> &'static dyn QnbitKernels {
        self.kernels
    }

    pub fn is_available(&self, bit_width: BitWidth, blk_len: usize, compute_type: ComputeType) -> bool {
        is_qnbit_gemm_available(self.kernels, bit_width, blk_len, compute_type)
    }

    fn ensure_available(&self, scheme: &QuantScheme, compute_type: ComputeType) -> QnbitResult<()> {
        QuantScheme::validate_blk_len(scheme.blk_len)?;
        if !self.is_available(scheme.bit_width, scheme.blk_len, compute_type) {
            return Err(QnbitError::unsupported(format!(
                "{} B with {} compute on {} kernels",
                scheme.bit_width,
                compute_type,
                self.kernels.name()
            )));
        }
        Ok(())
    }

    /// Bytes of the buffer [`Self::pack_quant_b_data`] fills.
    pub fn pack_quant_b_data_size(
        &self,
        n: usize,
        k: usize,
        scheme: &QuantScheme,
        compute_type: ComputeType,
    ) -> QnbitResult<usize> {
        self.ensure_available(scheme, compute_type)?;
        let slot = match scheme.bit_width {
            BitWidth::Four => self.kernels.q4bit_gemm_pack_quant_b_data_size(),
            BitWidth::Eight => self.kernels.q8bit_gemm_pack_quant_b_data_size(),
        };
        let size_fn = slot.ok_or_else(|| QnbitError::unsupported("pack size slot"))?;
        Ok(size_fn(n, k, scheme.blk_len, scheme.has_zero_point, compute_type))
    }

    /// Pack raw column-major quantized B for `compute_type`.
    ///
    /// Float compute types only reorder `quant_b.data`. Int8 also writes
    /// the scales and the zero-point block sums, so `quant_b.scale` and
    /// `quant_b.zero_point` must be filled. The packed buffer must not move
    /// between this call and the GEMMs that read it.
    pub fn pack_quant_b_data(
        &self,
        n: usize,
        k: usize,
        scheme: &QuantScheme,
        compute_type: ComputeType,
        quant_b: &QuantBColumns<'_, f32>,
        packed_b: &mut [u8],
    ) -> QnbitResult<()> {
        let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };
        let required = self.pack_quant_b_data_size(n, k, scheme, compute_type)?;
        if packed_b.len() < required {
            return Err(QnbitError::BufferTooSmall {
                what: "packed quant B buffer",
                required,
                actual: packed_b.len(),
            });
        }
        let block_count_k = scheme.block_count_k(k);
        let blocks = n * block_count_k;
        check_len("quant B data", blocks * scheme.blk_data_size(), quant_b.data.len())?;
        let quant_b = QuantBColumns {
            zero_point: quant_b.zero_point.filter(|_| scheme.has_zero_point),
            block_stride: block_count_k,
            ..*quant_b
        };

        match compute_type {
            ComputeType::Fp32 | ComputeType::Fp16 => {
                let slot = if compute_type == ComputeType::Fp32 {
                    self.kernels.sq4bit_gemm_pack_quant_b_data()
                } else {
                    self.kernels.hq4bit_gemm_pack_quant_b_data()
                };
                let pack = slot.ok_or_else(|| QnbitError::unsupported("pack slot"))?;
                pack(n, k, scheme.blk_len, quant_b.data, packed_b);
            }
            ComputeType::Int8 => {
                check_len("quant B scale", blocks, quant_b.scale.len())?;
                check_zero_points(scheme, block_count_k, n, quant_b.zero_point)?;
                let slot = match scheme.bit_width {
                    BitWidth::Four => self.kernels.sq4bit_gemm_pack_quant_b_data_and_blk_sum(),
                    BitWidth::Eight => self.kernels.sq8bit_gemm_pack_quant_b_data_and_blk_sum(),
                };
                let pack = slot.ok_or_else(|| QnbitError::unsupported("pack and block-sum slot"))?;
                let shape = packed_shape(n, block_count_k, scheme);
                let regions = PackedQuantBLayout::for_buffer(packed_b, shape)?;
                let mut views = regions.split_mut(packed_b)?;
                pack(&quant_b, &mut views);
            }
        }

        if let Some(t) = _t {
            log::trace!(
                "[perf] qnbit::pack_quant_b {} {} [{}x{}] {:.3}ms",
                scheme.bit_width,
                compute_type,
                k,
                n,
                t.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(())
    }

    /// Workspace bytes for one GEMM; 0 for the float compute types.
    pub fn per_gemm_workspace_size(&self, params: &QnbitGemmParams) -> usize {
        let scheme = &params.scheme;
        self.kernels.per_gemm_workspace_size().map_or(0, |f| {
            f(params.m, params.n, params.k, scheme.blk_len, scheme.has_zero_point, params.compute_type)
        })
    }

    pub fn per_gemm_workspace_alignment(&self, params: &QnbitGemmParams) -> usize {
        self.kernels
            .per_gemm_workspace_alignment()
            .map_or(1, |f| f(params.scheme.blk_len, params.compute_type))
    }

    /// Workspace bytes for `batch` GEMMs, including slack for aligning the
    /// start of an arbitrary buffer.
    pub fn batch_workspace_size(&self, params: &QnbitGemmParams, batch: usize) -> usize {
        workspace::batch_workspace_size(
            self.per_gemm_workspace_size(params),
            self.per_gemm_workspace_alignment(params),
            batch,
        )
    }

    /// f32 activations: `Fp32` or `Int8` compute.
    pub fn gemm_f32(
        &self,
        params: &QnbitGemmParams,
        data: &mut GemmDataParams<'_, f32>,
        workspace: Option<&mut [u8]>,
    ) -> QnbitResult<()> {
        self.gemm_batch_f32(params, std::slice::from_mut(data), workspace)
    }

    /// Runs every GEMM of `data` with the shared `params`. Workspace for
    /// GEMM `i` starts `i` strides past the first aligned byte.
    pub fn gemm_batch_f32(
        &self,
        params: &QnbitGemmParams,
        data: &mut [GemmDataParams<'_, f32>],
        mut workspace: Option<&mut [u8]>,
    ) -> QnbitResult<()> {
        if params.compute_type == ComputeType::Fp16 {
            return Err(QnbitError::unsupported("fp16 compute with f32 activations"));
        }
        self.ensure_available(&params.scheme, params.compute_type)?;
        for d in data.iter() {
            validate(params, d)?;
        }
        if params.is_empty() || data.is_empty() {
            return Ok(());
        }

        let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };
        let per_gemm = self.per_gemm_workspace_size(params);
        let alignment = self.per_gemm_workspace_alignment(params);
        let stride = workspace::per_gemm_workspace_stride(per_gemm, alignment);
        // one variant for the whole batch, whatever the policy does meanwhile
        let packed_int8 = params.compute_type == ComputeType::Int8
            && params.scheme.bit_width == BitWidth::Four
            && self.use_packed_int8(params);

        for (i, d) in data.iter_mut().enumerate() {
            match params.compute_type {
                ComputeType::Fp32 => self.gemm_fp32(params, d)?,
                ComputeType::Int8 => {
                    let ws = per_gemm_region(workspace.as_deref_mut(), i, per_gemm, stride, alignment)?;
                    self.gemm_int8(params, d, ws, packed_int8)?;
                }
                ComputeType::Fp16 => return Err(QnbitError::unsupported("fp16 compute with f32 activations")),
            }
        }

        if let Some(t) = _t {
            log::trace!(
                "[perf] qnbit::gemm_batch_f32 {} {} x{} [{}x{}]x[{}x{}] {:.3}ms",
                params.scheme.bit_width,
                params.compute_type,
                data.len(),
                params.m,
                params.k,
                params.k,
                params.n,
                t.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(())
    }

    /// f16 activations and scales: `Fp16` compute only.
    pub fn gemm_f16(&self, params: &QnbitGemmParams, data: &mut GemmDataParams<'_, f16>) -> QnbitResult<()> {
        self.gemm_batch_f16(params, std::slice::from_mut(data))
    }

    pub fn gemm_batch_f16(
        &self,
        params: &QnbitGemmParams,
        data: &mut [GemmDataParams<'_, f16>],
    ) -> QnbitResult<()> {
        if params.compute_type != ComputeType::Fp16 {
            return Err(QnbitError::unsupported(format!(
                "{} compute with f16 activations",
                params.compute_type
            )));
        }
        self.ensure_available(&params.scheme, params.compute_type)?;
        for d in data.iter() {
            validate(params, d)?;
        }
        if params.is_empty() || data.is_empty() {
            return Ok(());
        }

        let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };
        for d in data.iter_mut() {
            self.gemm_fp16(params, d)?;
        }
        if let Some(t) = _t {
            log::trace!(
                "[perf] qnbit::gemm_batch_f16 x{} [{}x{}]x[{}x{}] {:.3}ms",
                data.len(),
                params.m,
                params.k,
                params.k,
                params.n,
                t.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(())
    }

    fn gemm_fp32(&self, params: &QnbitGemmParams, data: &mut GemmDataParams<'_, f32>) -> QnbitResult<()> {
        let QnbitGemmParams { m, n, k, scheme, .. } = *params;
        let blk_len = scheme.blk_len;
        let parallel = is_parallel(params);
        let quant_b = float_columns(params, data.packed_b, data.scale, data.zero_point);
        let (a, lda, ldc, bias) = (data.a, data.lda, data.ldc, data.bias);

        if few_rows(m, parallel) {
            let kernel = self
                .kernels
                .sq4bit_gemm_m1_kernel_comp_fp32()
                .ok_or_else(|| QnbitError::unsupported("fp32 M1 kernel"))?;
            let tile_n = col_tile(n, parallel);
            for r in 0..m {
                let a_row = &a[r * lda..r * lda + k];
                for_each_tile(&mut data.c[r * ldc..r * ldc + n], tile_n, parallel, |t, c_tile| {
                    let n_start = t * tile_n;
                    let cols = quant_b.offset_columns(BitWidth::Four, blk_len, n_start);
                    kernel(blk_len, a_row, &cols, c_tile, c_tile.len(), k, bias.map(|b| &b[n_start..]));
                    Ok(())
                })?;
            }
            return Ok(());
        }

        let dequant = self
            .kernels
            .sq4bit_blk_dequant_b_for_sgemm_comp_fp32()
            .ok_or_else(|| QnbitError::unsupported("fp32 dequantize slot"))?;
        let tile_m = row_tile(m, parallel);
        for_each_tile(&mut data.c[..(m - 1) * ldc + n], tile_m * ldc, parallel, |t, c_tile| {
            let m_start = t * tile_m;
            let rows = (m - m_start).min(tile_m);
            let mut strip = [0.0f32; DEQUANT_CHUNK_K * BLK_SUM_PANEL_N];
            for_each_strip(n, k, blk_len, &quant_b, |n0, lanes, k0, count_k, chunk| {
                dequant(blk_len, &mut strip, chunk, lanes, count_k);
                let first = k0 == 0;
                sgemm_panel16(
                    &a[m_start * lda + k0..],
                    lda,
                    &strip,
                    layout::align_up(count_k, blk_len),
                    &mut c_tile[n0..],
                    ldc,
                    rows,
                    lanes,
                    count_k,
                    bias.filter(|_| first).map(|b| &b[n0..]),
                    !first,
                );
            });
            Ok(())
        })
    }

    fn gemm_fp16(&self, params: &QnbitGemmParams, data: &mut GemmDataParams<'_, f16>) -> QnbitResult<()> {
        let QnbitGemmParams { m, n, k, scheme, .. } = *params;
        let blk_len = scheme.blk_len;
        let parallel = is_parallel(params);
        let dequant = self
            .kernels
            .hq4bit_blk_dequant_b_for_hgemm_comp_fp16()
            .ok_or_else(|| QnbitError::unsupported("fp16 dequantize slot"))?;
        let kernel = self
            .kernels
            .hq4bit_gemm_kernel_comp_fp16()
            .ok_or_else(|| QnbitError::unsupported("fp16 kernel"))?;

        let quant_b = float_columns(params, data.packed_b, data.scale, data.zero_point);
        let (a, lda, ldc, bias) = (data.a, data.lda, data.ldc, data.bias);
        let fp16 = Fp16Strips { dequant, kernel, blk_len, k, lda, ldc };

        if few_rows(m, parallel) {
            let tile_n = col_tile(n, parallel);
            for r in 0..m {
                let a_row = &a[r * lda..r * lda + k];
                for_each_tile(&mut data.c[r * ldc..r * ldc + n], tile_n, parallel, |t, c_tile| {
                    let n_start = t * tile_n;
                    let cols = quant_b.offset_columns(BitWidth::Four, blk_len, n_start);
                    fp16.run(a_row, c_tile, 1, c_tile.len(), &cols, bias.map(|b| &b[n_start..]));
                    Ok(())
                })?;
            }
            return Ok(());
        }

        let tile_m = row_tile(m, parallel);
        for_each_tile(&mut data.c[..(m - 1) * ldc + n], tile_m * ldc, parallel, |t, c_tile| {
            let m_start = t * tile_m;
            let rows = (m - m_start).min(tile_m);
            fp16.run(&a[m_start * lda..], c_tile, rows, n, &quant_b, bias);
            Ok(())
        })
    }

    fn gemm_int8(
        &self,
        params: &QnbitGemmParams,
        data: &mut GemmDataParams<'_, f32>,
        workspace: &mut [u8],
        packed_int8: bool,
    ) -> QnbitResult<()> {
        let scheme = &params.scheme;
        let shape = packed_shape(params.n, params.block_count_k(), scheme);
        let packed_b = PackedQuantBLayout::for_buffer(data.packed_b, shape)?.split(data.packed_b)?;

        if packed_int8 {
            log::trace!("[qnbit] int8 variant: packed");
            return self.gemm_int8_packed(params, data, &packed_b, workspace);
        }
        let blk_sum_kernel = match scheme.bit_width {
            BitWidth::Four => self.kernels.sq4bit_gemm_kernel_blk_sum_comp_int8(),
            BitWidth::Eight => self.kernels.sq8bit_gemm_kernel_blk_sum_comp_int8(),
        };
        if let (Some(kernel), Some(quantize)) =
            (blk_sum_kernel, self.kernels.quantize_a_row_compute_blk_sum_comp_int8())
        {
            log::trace!("[qnbit] int8 variant: block sum");
            return gemm_int8_blk_sum(params, data, &packed_b, workspace, kernel, quantize);
        }
        log::trace!("[qnbit] int8 variant: row count");
        self.gemm_int8_rows(params, data, &packed_b, workspace)
    }

    /// Whether the packed pair is bound and the table's predicate picks it
    /// under the policy in effect now.
    fn use_packed_int8(&self, params: &QnbitGemmParams) -> bool {
        let bound = self.kernels.sq4bit_gemm_kernel_packed_comp_int8().is_some()
            && self.kernels.quantize_a_packed_comp_int8().is_some();
        bound
            && self
                .kernels
                .use_packed_comp_int8()
                .is_some_and(|f| f(params.k, params.scheme.blk_len, params.scheme.has_zero_point))
    }

    fn gemm_int8_packed(
        &self,
        params: &QnbitGemmParams,
        data: &mut GemmDataParams<'_, f32>,
        packed_b: &PackedQuantBRef<'_>,
        workspace: &mut [u8],
    ) -> QnbitResult<()> {
        let QnbitGemmParams { m, n, k, scheme, .. } = *params;
        let (kernel, quantize) = match (
            self.kernels.sq4bit_gemm_kernel_packed_comp_int8(),
            self.kernels.quantize_a_packed_comp_int8(),
        ) {
            (Some(kernel), Some(quantize)) => (kernel, quantize),
            _ => return Err(QnbitError::unsupported("packed int8 kernel pair")),
        };
        let row_bytes = params.block_count_k() * layout::q8_blk_size(scheme.blk_len);
        let quant_a = q8_rows(workspace, m * row_bytes)?;
        quantize(scheme.blk_len, data.a, m, k, data.lda, quant_a);
        let quant_a: &[u8] = quant_a;

        let (ldc, bias) = (data.ldc, data.bias);
        let parallel = is_parallel(params);
        let tile_m = row_tile(m, parallel);
        for_each_tile(&mut data.c[..(m - 1) * ldc + n], tile_m * ldc, parallel, |t, c_tile| {
            let m_start = t * tile_m;
            let rows = (m - m_start).min(tile_m);
            kernel(scheme.blk_len, quant_a, packed_b, c_tile, m_start, rows, 0, n, k, ldc, bias);
            Ok(())
        })
    }

    fn gemm_int8_rows(
        &self,
        params: &QnbitGemmParams,
        data: &mut GemmDataParams<'_, f32>,
        packed_b: &PackedQuantBRef<'_>,
        workspace: &mut [u8],
    ) -> QnbitResult<()> {
        let QnbitGemmParams { m, n, k, scheme, .. } = *params;
        let (kernel, quantize) =
            match (self.kernels.sq4bit_gemm_kernel_comp_int8(), self.kernels.quantize_a_row_comp_int8()) {
                (Some(kernel), Some(quantize)) => (kernel, quantize),
                _ => return Err(QnbitError::unsupported("int8 kernel pair")),
            };
        let block_count_k = params.block_count_k();
        let blk_len = scheme.blk_len;
        let row_bytes = block_count_k * layout::q8_blk_size(blk_len);
        let parallel = is_parallel(params);

        let (a, lda) = (data.a, data.lda);
        let quant_a = q8_rows(workspace, m * row_bytes)?;
        for_each_tile(quant_a, row_bytes, parallel, |row, q| {
            quantize(blk_len, &a[row * lda..row * lda + k], k, q);
            Ok(())
        })?;
        let quant_a: &[u8] = quant_a;

        check_zero_points(&scheme, block_count_k, n, data.zero_point)?;
        // packed data and scales; raw zero points, which the kernel applies itself
        let quant_b = QuantBColumns {
            zero_point: data.zero_point.filter(|_| scheme.has_zero_point),
            ..packed_b.columns()
        };
        let (ldc, bias) = (data.ldc, data.bias);
        let tile_m = row_tile(m, parallel);
        for_each_tile(&mut data.c[..(m - 1) * ldc + n], tile_m * ldc, parallel, |t, c_tile| {
            let m_start = t * tile_m;
            let rows = (m - m_start).min(tile_m);
            let mut done = 0;
            while done < rows {
                let processed = kernel(
                    blk_len,
                    &quant_a[(m_start + done) * row_bytes..],
                    &quant_b,
                    &mut c_tile[done * ldc..],
                    rows - done,
                    n,
                    k,
                    block_count_k,
                    ldc,
                    bias,
                );
                if processed == 0 {
                    return Err(QnbitError::InvalidData("int8 kernel made no progress".into()));
                }
                done += processed;
            }
            Ok(())
        })
    }
}

/// Block-sum variant: quantize A with per-block sums, then run the kernel,
/// which folds in the zero-point term `A_blk_sum x B_blk_sum` itself.
fn gemm_int8_blk_sum(
    params: &QnbitGemmParams,
    data: &mut GemmDataParams<'_, f32>,
    packed_b: &PackedQuantBRef<'_>,
    workspace: &mut [u8],
    kernel: SQNBitGemmKernelBlkSumCompInt8Fn,
    quantize: QuantizeARowComputeBlkSumCompInt8Fn,
) -> QnbitResult<()> {
    let QnbitGemmParams { m, n, k, scheme, .. } = *params;
    let block_count_k = params.block_count_k();
    let blk_len = scheme.blk_len;
    let parallel = is_parallel(params);

    let regions = WorkspaceLayout::new(workspace, m, block_count_k, blk_len)?;
    let views = regions.split_mut(workspace)?;
    let (a, lda) = (data.a, data.lda);
    let row_values = block_count_k * blk_len;
    if parallel {
        views
            .data
            .par_chunks_mut(row_values)
            .zip(views.scale.par_chunks_mut(block_count_k))
            .zip(views.blk_sum.par_chunks_mut(block_count_k))
            .enumerate()
            .for_each(|(row, ((q, s), bs))| quantize(blk_len, &a[row * lda..row * lda + k], k, q, s, bs));
    } else {
        let rows = views
            .data
            .chunks_mut(row_values)
            .zip(views.scale.chunks_mut(block_count_k))
            .zip(views.blk_sum.chunks_mut(block_count_k));
        for (row, ((q, s), bs)) in rows.enumerate() {
            quantize(blk_len, &a[row * lda..row * lda + k], k, q, s, bs);
        }
    }
    let quant_a = views.as_ref();

    let quant_b = packed_b.columns();
    let (ldc, bias) = (data.ldc, data.bias);
    let tile_m = row_tile(m, parallel);
    for_each_tile(&mut data.c[..(m - 1) * ldc + n], tile_m * ldc, parallel, |t, c_tile| {
        let m_start = t * tile_m;
        let rows = (m - m_start).min(tile_m);
        let mut done = 0;
        while done < rows {
            let r0 = m_start + done;
            let tile_a = QuantABlkSum {
                data: &quant_a.data[r0 * row_values..],
                scale: &quant_a.scale[r0 * block_count_k..],
                blk_sum: &quant_a.blk_sum[r0 * block_count_k..],
            };
            let processed = kernel(
                blk_len,
                &tile_a,
                &quant_b,
                &mut c_tile[done * ldc..],
                rows - done,
                n,
                k,
                block_count_k,
                ldc,
                bias,
                packed_b.blk_sum,
            );
            if processed == 0 {
                return Err(QnbitError::InvalidData("int8 block-sum kernel made no progress".into()));
            }
            done += processed;
        }
        Ok(())
    })
}

/// `(data, scale, zero_point)` of float-path B, with zero points dropped
/// when the scheme carries none.
fn float_columns<'a, S>(
    params: &QnbitGemmParams,
    packed_b: &'a [u8],
    scale: &'a [S],
    zero_point: Option<&'a [u8]>,
) -> QuantBColumns<'a, S> {
    QuantBColumns {
        data: packed_b,
        scale,
        zero_point: zero_point.filter(|_| params.scheme.has_zero_point),
        block_stride: params.block_count_k(),
    }
}

fn packed_shape(n: usize, block_count_k: usize, scheme: &QuantScheme) -> PackedQuantBShape {
    PackedQuantBShape { n, block_count_k, blk_len: scheme.blk_len, bit_width: scheme.bit_width }
}

/// Rows of K dequantized at once on the float paths. Twice the largest block
/// length, so a chunk always starts on an even block.
const DEQUANT_CHUNK_K: usize = 2 * MAX_BLK_LEN;

/// Rows per fp16 kernel call when adding a later K chunk into C.
const FP16_ROW_GROUP: usize = 4;

/// Walks B in 16-column strips and `DEQUANT_CHUNK_K` chunks of K, calling
/// `f(n0, lanes, k0, count_k, chunk)` with `chunk` viewing columns
/// `n0..n0 + lanes` from block `k0 / blk_len` on.
fn for_each_strip<S, F>(count_n: usize, k: usize, blk_len: usize, quant_b: &QuantBColumns<'_, S>, mut f: F)
where
    F: FnMut(usize, usize, usize, usize, &QuantBColumns<'_, S>),
{
    for n0 in (0..count_n).step_by(BLK_SUM_PANEL_N) {
        let lanes = (count_n - n0).min(BLK_SUM_PANEL_N);
        let cols = quant_b.offset_columns(BitWidth::Four, blk_len, n0);
        for k0 in (0..k).step_by(DEQUANT_CHUNK_K) {
            let chunk = cols.offset_blocks(BitWidth::Four, blk_len, k0 / blk_len);
            f(n0, lanes, k0, (k - k0).min(DEQUANT_CHUNK_K), &chunk);
        }
    }
}

/// The fp16 slots plus the strides of one GEMM.
struct Fp16Strips {
    dequant: HQ4BitBlkDequantBForHgemmCompFp16Fn,
    kernel: HQ4BitGemmKernelCompFp16Fn,
    blk_len: usize,
    k: usize,
    lda: usize,
    ldc: usize,
}

impl Fp16Strips {
    /// `rows` rows of C, columns `0..count_n`. The first K chunk writes C with
    /// bias; later chunks go through a small buffer and are added in f32.
    fn run(
        &self,
        a: &[f16],
        c: &mut [f16],
        rows: usize,
        count_n: usize,
        quant_b: &QuantBColumns<'_, f16>,
        bias: Option<&[f16]>,
    ) {
        let Self { dequant, kernel, blk_len, k, lda, ldc } = *self;
        let mut strip = [f16::ZERO; DEQUANT_CHUNK_K * BLK_SUM_PANEL_N];
        let mut partial = [f16::ZERO; FP16_ROW_GROUP * BLK_SUM_PANEL_N];
        for_each_strip(count_n, k, blk_len, quant_b, |n0, lanes, k0, count_k, chunk| {
            dequant(blk_len, &mut strip, chunk, lanes, count_k);
            let ldb = layout::align_up(count_k, blk_len);
            if k0 == 0 {
                kernel(a, &strip, bias.map(|b| &b[n0..]), &mut c[n0..], rows, lanes, count_k, lda, ldb, ldc);
                return;
            }
            for r0 in (0..rows).step_by(FP16_ROW_GROUP) {
                let group = (rows - r0).min(FP16_ROW_GROUP);
                kernel(&a[r0 * lda + k0..], &strip, None, &mut partial, group, lanes, count_k, lda, ldb, BLK_SUM_PANEL_N);
                for r in 0..group {
                    let c_row = &mut c[(r0 + r) * ldc + n0..(r0 + r) * ldc + n0 + lanes];
                    for (out, p) in c_row.iter_mut().zip(&partial[r * BLK_SUM_PANEL_N..]) {
                        *out = f16::from_f32(out.to_f32() + p.to_f32());
                    }
                }
            }
        });
    }
}

/// Too few rows to split across the pool; such GEMMs walk one row at a time
/// and split columns instead.
fn few_rows(m: usize, parallel: bool) -> bool {
    m == 1 || (parallel && m < rayon::current_num_threads())
}

fn is_parallel(params: &QnbitGemmParams) -> bool {
    params.m.saturating_mul(params.n).saturating_mul(params.k) >= gemm_par_threshold()
}

/// Columns per tile; a multiple of the 16-column panel width.
fn col_tile(n: usize, parallel: bool) -> usize {
    let per_thread = if parallel { n / rayon::current_num_threads() } else { n };
    layout::align_up(per_thread.max(BLK_SUM_PANEL_N), BLK_SUM_PANEL_N)
}

fn row_tile(m: usize, parallel: bool) -> usize {
    if parallel {
        layout::div_round_up(m, rayon::current_num_threads()).max(1)
    } else {
        m.max(1)
    }
}

/// Runs `f(tile_index, tile)` over `tile_len` pieces of `buf`, on the rayon
/// pool when `parallel`. Tiles are disjoint, so each worker owns its slice.
fn for_each_tile<T, F>(buf: &mut [T], tile_len: usize, parallel: bool, f: F) -> QnbitResult<()>
where
    T: Send,
    F: Fn(usize, &mut [T]) -> QnbitResult<()> + Sync + Send,
{
    if buf.is_empty() || tile_len == 0 {
        return Ok(());
    }
    if parallel {
        buf.par_chunks_mut(tile_len).enumerate().try_for_each(|(t, tile)| f(t, tile))
    } else {
        buf.chunks_mut(tile_len).enumerate().try_for_each(|(t, tile)| f(t, tile))
    }
}

/// The aligned workspace region of batch entry `index`.
fn per_gemm_region(
    workspace: Option<&mut [u8]>,
    index: usize,
    per_gemm: usize,
    stride: usize,
    alignment: usize,
) -> QnbitResult<&mut [u8]> {
    let buf = workspace.ok_or(QnbitError::BufferTooSmall { what: "workspace", required: per_gemm, actual: 0 })?;
    let start = workspace::aligned_start(buf, alignment) + index * stride;
    let end = start + per_gemm;
    if end > buf.len() {
        return Err(QnbitError::BufferTooSmall { what: "workspace", required: end, actual: buf.len() });
    }
    Ok(&mut buf[start..end])
}

/// The first `len` bytes of the workspace, for interleaved Q8 rows of A.
fn q8_rows(workspace: &mut [u8], len: usize) -> QnbitResult<&mut [u8]> {
    let actual = workspace.len();
    workspace.get_mut(..len).ok_or(QnbitError::BufferTooSmall { what: "workspace", required: len, actual })
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> QnbitResult<()> {
    if actual < expected {
        return Err(QnbitError::ShapeMismatch { what, expected, actual });
    }
    Ok(())
}

fn check_zero_points(
    scheme: &QuantScheme,
    block_count_k: usize,
    n: usize,
    zero_point: Option<&[u8]>,
) -> QnbitResult<()> {
    if !scheme.has_zero_point {
        return Ok(());
    }
    let zp = zero_point.ok_or_else(|| QnbitError::InvalidData("scheme has zero points but none given".into()))?;
    check_len("zero points", n * layout::zero_points_size_in_bytes(scheme.bit_width, block_count_k), zp.len())
}

fn validate<T>(params: &QnbitGemmParams, data: &GemmDataParams<'_, T>) -> QnbitResult<()> {
    let QnbitGemmParams { m, n, k, scheme, compute_type } = *params;
    if params.is_empty() {
        return Ok(());
    }
    check_len("lda", k, data.lda)?;
    check_len("ldc", n, data.ldc)?;
    check_len("A", (m - 1) * data.lda + k, data.a.len())?;
    check_len("C", (m - 1) * data.ldc + n, data.c.len())?;
    if let Some(bias) = data.bias {
        check_len("bias", n, bias.len())?;
    }

    let block_count_k = scheme.block_count_k(k);
    let blocks = n * block_count_k;
    match compute_type {
        ComputeType::Fp32 | ComputeType::Fp16 => {
            check_len("packed quant B data", blocks * scheme.blk_data_size(), data.packed_b.len())?;
            check_len("quant B scale", blocks, data.scale.len())?;
            check_zero_points(&scheme, block_count_k, n, data.zero_point)
        }
        // packed data, scales and block sums are checked when the buffer is split
        ComputeType::Int8 => match data.zero_point {
            Some(zp) if scheme.has_zero_point => check_len(
                "zero points",
                n * layout::zero_points_size_in_bytes(scheme.bit_width, block_count_k),
                zp.len(),
            ),
            _ => Ok(()),
        },
    }
}

/// `C = A * B (+ bias)` on the host's kernels. See [`QnbitGemm::gemm_f32`].
pub fn qnbit_gemm(
    params: &QnbitGemmParams,
    data: &mut GemmDataParams<'_, f32>,
    workspace: Option<&mut [u8]>,
) -> QnbitResult<()> {
    QnbitGemm::new().gemm_f32(params, data, workspace)
}

/// Batched form of [`qnbit_gemm`].
pub fn qnbit_gemm_batch(
    params: &QnbitGemmParams,
    data: &mut [GemmDataParams<'_, f32>],
    workspace: Option<&mut [u8]>,
) -> QnbitResult<()> {
    QnbitGemm::new().gemm_batch_f32(params, data, workspace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme(bit_width: BitWidth, blk_len: usize, has_zero_point: bool) -> QuantScheme {
        QuantScheme { bit_width, blk_len, has_zero_point }
    }

    #[test]
    fn test_scalar_availability() {
        let gemm = QnbitGemm::with_capability(Capability::Scalar).unwrap();
        assert!(gemm.is_available(BitWidth::Four, 32, ComputeType::Fp32));
        assert!(gemm.is_available(BitWidth::Four, 32, ComputeType::Fp16));
        assert!(gemm.is_available(BitWidth::Four, 4, ComputeType::Int8));
        assert!(gemm.is_available(BitWidth::Eight, 64, ComputeType::Int8));
        assert!(!gemm.is_available(BitWidth::Eight, 64, ComputeType::Fp32));
        assert!(!gemm.is_available(BitWidth::Four, 24, ComputeType::Fp32));
        assert!(!gemm.is_available(BitWidth::Four, 512, ComputeType::Int8));
    }

    #[test]
    fn test_pack_size_unsupported_variant() {
        let gemm = QnbitGemm::with_capability(Capability::Scalar).unwrap();
        let err = gemm.pack_quant_b_data_size(4, 64, &scheme(BitWidth::Eight, 32, false), ComputeType::Fp16);
        assert!(matches!(err, Err(QnbitError::Unsupported { .. })));
        let size = gemm.pack_quant_b_data_size(4, 64, &scheme(BitWidth::Four, 32, false), ComputeType::Fp32);
        assert_eq!(size.unwrap(), 4 * 2 * 16);
    }

    #[test]
    fn test_zero_counts_are_noop() {
        let gemm = QnbitGemm::with_capability(Capability::Scalar).unwrap();
        for compute_type in [ComputeType::Fp32, ComputeType::Int8] {
            let params = QnbitGemmParams { m: 0, n: 4, k: 32, scheme: scheme(BitWidth::Four, 32, false), compute_type };
            let mut c: [f32; 0] = [];
            let mut data = GemmDataParams {
                a: &[],
                lda: 32,
                packed_b: &[],
                scale: &[],
                zero_point: None,
                bias: None,
                c: &mut c,
                ldc: 4,
            };
            gemm.gemm_f32(&params, &mut data, None).unwrap();
        }
    }

    #[test]
    fn test_shape_validation() {
        let gemm = QnbitGemm::with_capability(Capability::Scalar).unwrap();
        let params = QnbitGemmParams {
            m: 2,
            n: 4,
            k: 32,
            scheme: scheme(BitWidth::Four, 32, false),
            compute_type: ComputeType::Fp32,
        };
        let a = vec![0.0f32; 64];
        let packed = vec![0u8; 64];
        let scale = vec![1.0f32; 4];
        let mut c = vec![0.0f32; 8];
        let mut data = GemmDataParams {
            a: &a,
            lda: 32,
            packed_b: &packed,
            scale: &scale,
            zero_point: None,
            bias: None,
            c: &mut c,
            ldc: 3,
        };
        assert!(matches!(
            gemm.gemm_f32(&params, &mut data, None),
            Err(QnbitError::ShapeMismatch { what: "ldc", .. })
        ));
        data.ldc = 4;
        data.lda = 16;
        assert!(matches!(
            gemm.gemm_f32(&params, &mut data, None),
            Err(QnbitError::ShapeMismatch { what: "lda", .. })
        ));
    }

    #[test]
    fn test_int8_requires_workspace() {
        let gemm = QnbitGemm::with_capability(Capability::Scalar).unwrap();
        let s = scheme(BitWidth::Four, 32, false);
        let (m, n, k) = (1, 4, 32);
        let size = gemm.pack_quant_b_data_size(n, k, &s, ComputeType::Int8).unwrap();
        let mut packed = vec![0u8; size];
        let raw = vec![0x88u8; n * 16];
        let scale = vec![1.0f32; n];
        let cols = QuantBColumns { data: &raw[..], scale: &scale[..], zero_point: None, block_stride: 1 };
        gemm.pack_quant_b_data(n, k, &s, ComputeType::Int8, &cols, &mut packed).unwrap();

        let params = QnbitGemmParams { m, n, k, scheme: s, compute_type: ComputeType::Int8 };
        let a = vec![1.0f32; k];
        let mut c = vec![0.0f32; n];
        let mut data = GemmDataParams {
            a: &a,
            lda: k,
            packed_b: &packed,
            scale: &scale,
            zero_point: None,
            bias: None,
            c: &mut c,
            ldc: n,
        };
        assert!(matches!(
            gemm.gemm_f32(&params, &mut data, None),
            Err(QnbitError::BufferTooSmall { what: "workspace", .. })
        ));
    }

    #[test]
    fn test_tiles() {
        assert_eq!(col_tile(5, false), 16);
        assert_eq!(col_tile(40, false), 48);
        assert_eq!(col_tile(1000, true) % BLK_SUM_PANEL_N, 0);
        assert_eq!(row_tile(7, false), 7);
        assert!(row_tile(7, true) >= 1);

        let mut buf = vec![0u32; 10];
        for_each_tile(&mut buf, 3, true, |t, tile| {
            tile.iter_mut().for_each(|v| *v = t as u32 + 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(buf, [1, 1, 1, 2, 2, 2, 3, 3, 3, 4]);
    }
}
