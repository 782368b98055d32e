//! Query-planner negotiation records and their `sqlite3_index_info` marshalling.

use core::ffi::c_void;
use core::ptr::NonNull;

use crate::error::{Error, Result};
use crate::marshal::{self, next_offset_of};
use crate::provider::{ApiVersion, Sqlite3Api};

/// Constraint operator reported by the planner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
    Like,
    Glob,
    Regexp,
    Ne,
    IsNot,
    IsNotNull,
    IsNull,
    Is,
    /// Operator code this crate does not name (kept verbatim).
    Other(u8),
}

impl IndexConstraintOp {
    /// Decode a native `SQLITE_INDEX_CONSTRAINT_*` code.
    pub const fn from_code(code: u8) -> Self {
        match code {
            2 => Self::Eq,
            4 => Self::Gt,
            8 => Self::Le,
            16 => Self::Lt,
            32 => Self::Ge,
            64 => Self::Match,
            65 => Self::Like,
            66 => Self::Glob,
            67 => Self::Regexp,
            68 => Self::Ne,
            69 => Self::IsNot,
            70 => Self::IsNotNull,
            71 => Self::IsNull,
            72 => Self::Is,
            other => Self::Other(other),
        }
    }

    /// Encode into the native operator code.
    pub const fn code(self) -> u8 {
        match self {
            Self::Eq => 2,
            Self::Gt => 4,
            Self::Le => 8,
            Self::Lt => 16,
            Self::Ge => 32,
            Self::Match => 64,
            Self::Like => 65,
            Self::Glob => 66,
            Self::Regexp => 67,
            Self::Ne => 68,
            Self::IsNot => 69,
            Self::IsNotNull => 70,
            Self::IsNull => 71,
            Self::Is => 72,
            Self::Other(code) => code,
        }
    }
}

/// One WHERE-clause term offered to the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexConstraint {
    /// Constrained column; `-1` is the rowid.
    pub column: i32,
    pub op: IndexConstraintOp,
    /// Whether the planner can use this term for the plan being evaluated.
    pub usable: bool,
    /// Engine-internal term offset, carried through unchanged.
    pub term_offset: i32,
}

/// One ORDER BY term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexOrderBy {
    pub column: i32,
    pub desc: bool,
}

/// The table's answer for one constraint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexConstraintUsage {
    /// 1-based position of this term's value in the xFilter arguments, `0`
    /// when the value is not needed.
    pub argv_index: i32,
    /// Ask the engine to skip re-checking the term.
    pub omit: bool,
}

/// `idxFlags` bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexFlags {
    bits: i32,
}

impl IndexFlags {
    /// The scan visits at most one row.
    pub const SCAN_UNIQUE: IndexFlags = IndexFlags { bits: 1 };

    /// Build an empty flag set.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Build a flag set from raw bits.
    pub const fn from_bits(bits: i32) -> Self {
        Self { bits }
    }

    /// Return the raw bit representation.
    pub const fn bits(self) -> i32 {
        self.bits
    }

    /// Return whether `other` is fully contained in this set.
    pub const fn contains(self, other: IndexFlags) -> bool {
        (self.bits & other.bits) == other.bits
    }
}

impl core::ops::BitOr for IndexFlags {
    type Output = IndexFlags;

    fn bitor(self, rhs: IndexFlags) -> IndexFlags {
        IndexFlags {
            bits: self.bits | rhs.bits,
        }
    }
}

/// Planner-provided half of a negotiation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexInputs {
    pub constraints: Vec<IndexConstraint>,
    pub order_bys: Vec<IndexOrderBy>,
}

/// Table-provided half of a negotiation. `None` leaves the engine default.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexOutputs {
    /// One entry per input constraint.
    pub constraint_usages: Vec<IndexConstraintUsage>,
    pub index_number: i32,
    pub index_string: Option<String>,
    pub order_by_consumed: bool,
    pub estimated_cost: Option<f64>,
    pub estimated_rows: Option<i64>,
    pub index_flags: Option<IndexFlags>,
    pub columns_used: Option<u64>,
}

/// One xBestIndex exchange.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexNegotiation {
    pub inputs: IndexInputs,
    pub outputs: IndexOutputs,
}

/// Which optional `sqlite3_index_info` tail fields the running library has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexCapabilities {
    estimated_rows: bool,
    index_flags: bool,
    columns_used: bool,
}

impl IndexCapabilities {
    /// First version with `estimatedRows`.
    pub const ESTIMATED_ROWS_SINCE: ApiVersion = ApiVersion::new(3, 8, 2);
    /// First version with `idxFlags`.
    pub const INDEX_FLAGS_SINCE: ApiVersion = ApiVersion::new(3, 9, 0);
    /// First version with `colUsed`.
    pub const COLUMNS_USED_SINCE: ApiVersion = ApiVersion::new(3, 10, 0);

    /// Capabilities of a library at `version`.
    pub fn from_version(version: ApiVersion) -> Self {
        Self {
            estimated_rows: version >= Self::ESTIMATED_ROWS_SINCE,
            index_flags: version >= Self::INDEX_FLAGS_SINCE,
            columns_used: version >= Self::COLUMNS_USED_SINCE,
        }
    }

    /// Capabilities of the library behind `api`.
    pub fn for_provider<P: Sqlite3Api>(api: &P) -> Self {
        Self::from_version(api.library_version())
    }

    pub fn can_use_estimated_rows(self) -> bool {
        self.estimated_rows
    }

    pub fn can_use_index_flags(self) -> bool {
        self.index_flags
    }

    pub fn can_use_columns_used(self) -> bool {
        self.columns_used
    }
}

/// Byte offsets of `sqlite3_index_info` and its element structs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexInfoLayout {
    pub n_constraint: usize,
    pub a_constraint: usize,
    pub n_order_by: usize,
    pub a_order_by: usize,
    pub a_constraint_usage: usize,
    pub idx_num: usize,
    pub idx_str: usize,
    pub need_to_free_idx_str: usize,
    pub order_by_consumed: usize,
    pub estimated_cost: usize,
    pub estimated_rows: usize,
    pub idx_flags: usize,
    pub col_used: usize,
    pub size: usize,
    pub constraint: ConstraintLayout,
    pub order_by: OrderByLayout,
    pub usage: UsageLayout,
}

/// `sqlite3_index_constraint` offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstraintLayout {
    pub column: usize,
    pub op: usize,
    pub usable: usize,
    pub term_offset: usize,
    pub size: usize,
}

/// `sqlite3_index_orderby` offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderByLayout {
    pub column: usize,
    pub desc: usize,
    pub size: usize,
}

/// `sqlite3_index_constraint_usage` offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageLayout {
    pub argv_index: usize,
    pub omit: usize,
    pub size: usize,
}

const INT: usize = 4;
const BYTE: usize = 1;
const WIDE: usize = 8;

const fn max(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

impl IndexInfoLayout {
    /// Layout for a target with `ptr`-byte pointers whose `double` and
    /// `sqlite3_int64` members are aligned to `wide_align` inside structs.
    ///
    /// LP64 and ARM32 use `(8, 8)` and `(4, 8)`; the i386 System V ABI packs
    /// 8-byte scalars at 4-byte alignment, `(4, 4)`.
    pub const fn for_target(ptr: usize, wide_align: usize) -> Self {
        let n_constraint = 0;
        let a_constraint = next_offset_of(n_constraint, INT, ptr);
        let n_order_by = next_offset_of(a_constraint, ptr, INT);
        let a_order_by = next_offset_of(n_order_by, INT, ptr);
        let a_constraint_usage = next_offset_of(a_order_by, ptr, ptr);
        let idx_num = next_offset_of(a_constraint_usage, ptr, INT);
        let idx_str = next_offset_of(idx_num, INT, ptr);
        let need_to_free_idx_str = next_offset_of(idx_str, ptr, INT);
        let order_by_consumed = next_offset_of(need_to_free_idx_str, INT, INT);
        let estimated_cost = next_offset_of(order_by_consumed, INT, wide_align);
        let estimated_rows = next_offset_of(estimated_cost, WIDE, wide_align);
        let idx_flags = next_offset_of(estimated_rows, WIDE, INT);
        let col_used = next_offset_of(idx_flags, INT, wide_align);
        let size = next_offset_of(col_used, WIDE, max(ptr, max(wide_align, INT)));

        let c_op = next_offset_of(0, INT, BYTE);
        let c_usable = next_offset_of(c_op, BYTE, BYTE);
        let c_term = next_offset_of(c_usable, BYTE, INT);
        let constraint = ConstraintLayout {
            column: 0,
            op: c_op,
            usable: c_usable,
            term_offset: c_term,
            size: next_offset_of(c_term, INT, INT),
        };
        let o_desc = next_offset_of(0, INT, BYTE);
        let order_by = OrderByLayout {
            column: 0,
            desc: o_desc,
            size: next_offset_of(o_desc, BYTE, INT),
        };
        let u_omit = next_offset_of(0, INT, BYTE);
        let usage = UsageLayout {
            argv_index: 0,
            omit: u_omit,
            size: next_offset_of(u_omit, BYTE, INT),
        };

        Self {
            n_constraint,
            a_constraint,
            n_order_by,
            a_order_by,
            a_constraint_usage,
            idx_num,
            idx_str,
            need_to_free_idx_str,
            order_by_consumed,
            estimated_cost,
            estimated_rows,
            idx_flags,
            col_used,
            size,
            constraint,
            order_by,
            usage,
        }
    }

    /// Layout for the compilation target.
    pub const fn native() -> Self {
        Self::for_target(
            core::mem::size_of::<*const c_void>(),
            max(core::mem::align_of::<f64>(), core::mem::align_of::<i64>()),
        )
    }
}

const LAYOUT: IndexInfoLayout = IndexInfoLayout::native();

fn count(raw: i32) -> usize {
    if raw < 0 { 0 } else { raw as usize }
}

impl IndexNegotiation {
    /// Fresh negotiation with one default usage per constraint.
    pub fn new(constraints: Vec<IndexConstraint>, order_bys: Vec<IndexOrderBy>) -> Self {
        let outputs = IndexOutputs {
            constraint_usages: vec![IndexConstraintUsage::default(); constraints.len()],
            ..IndexOutputs::default()
        };
        Self {
            inputs: IndexInputs {
                constraints,
                order_bys,
            },
            outputs,
        }
    }

    /// Read a native `sqlite3_index_info`. Outputs are read only when
    /// `include_output` is set; gated tail fields only when `caps` allow.
    ///
    /// # Safety
    /// `info` must point to a valid `sqlite3_index_info` whose arrays hold
    /// the counts it reports.
    pub unsafe fn from_native(
        caps: IndexCapabilities,
        info: *const c_void,
        include_output: bool,
    ) -> Result<Self> {
        if info.is_null() {
            return Err(Error::invalid_state("index info pointer is null"));
        }
        let n_constraint = count(unsafe { marshal::read_i32(info, LAYOUT.n_constraint) });
        let n_order_by = count(unsafe { marshal::read_i32(info, LAYOUT.n_order_by) });
        let constraints_ptr = unsafe { marshal::read_ptr(info, LAYOUT.a_constraint) };
        let order_bys_ptr = unsafe { marshal::read_ptr(info, LAYOUT.a_order_by) };
        if (n_constraint > 0 && constraints_ptr.is_null())
            || (n_order_by > 0 && order_bys_ptr.is_null())
        {
            return Err(Error::invalid_state("index info input array is null"));
        }

        let c = LAYOUT.constraint;
        let mut constraints = Vec::with_capacity(n_constraint);
        for i in 0..n_constraint {
            let base = unsafe { (constraints_ptr as *const u8).add(i * c.size) } as *const c_void;
            constraints.push(unsafe {
                IndexConstraint {
                    column: marshal::read_i32(base, c.column),
                    op: IndexConstraintOp::from_code(marshal::read_u8(base, c.op)),
                    usable: marshal::read_u8(base, c.usable) != 0,
                    term_offset: marshal::read_i32(base, c.term_offset),
                }
            });
        }

        let o = LAYOUT.order_by;
        let mut order_bys = Vec::with_capacity(n_order_by);
        for i in 0..n_order_by {
            let base = unsafe { (order_bys_ptr as *const u8).add(i * o.size) } as *const c_void;
            order_bys.push(unsafe {
                IndexOrderBy {
                    column: marshal::read_i32(base, o.column),
                    desc: marshal::read_u8(base, o.desc) != 0,
                }
            });
        }

        let mut negotiation = Self::new(constraints, order_bys);
        if include_output {
            unsafe { negotiation.outputs.read_native(caps, info, n_constraint)? };
        }
        Ok(negotiation)
    }

    /// Write this negotiation into a native `sqlite3_index_info`. Outputs are
    /// always written; inputs only when `include_input` is set, into the
    /// arrays the native struct already owns.
    ///
    /// # Safety
    /// `info` must point to a valid, writable `sqlite3_index_info`.
    pub unsafe fn to_native<P: Sqlite3Api>(
        &self,
        api: &P,
        caps: IndexCapabilities,
        info: *mut c_void,
        include_input: bool,
    ) -> Result<()> {
        if info.is_null() {
            return Err(Error::invalid_state("index info pointer is null"));
        }
        if include_input {
            unsafe { self.inputs.write_native(info)? };
        }
        unsafe { self.outputs.write_native(api, caps, info) }
    }
}

impl IndexInputs {
    unsafe fn write_native(&self, info: *mut c_void) -> Result<()> {
        let n_constraint = count(unsafe { marshal::read_i32(info, LAYOUT.n_constraint) });
        let n_order_by = count(unsafe { marshal::read_i32(info, LAYOUT.n_order_by) });
        if self.constraints.len() > n_constraint || self.order_bys.len() > n_order_by {
            return Err(Error::invalid_state(
                "index info arrays are smaller than the negotiation inputs",
            ));
        }
        let constraints_ptr = unsafe { marshal::read_ptr(info, LAYOUT.a_constraint) };
        let order_bys_ptr = unsafe { marshal::read_ptr(info, LAYOUT.a_order_by) };

        let c = LAYOUT.constraint;
        for (i, constraint) in self.constraints.iter().enumerate() {
            let base = unsafe { (constraints_ptr as *mut u8).add(i * c.size) } as *mut c_void;
            unsafe {
                marshal::write_i32(base, c.column, constraint.column);
                marshal::write_u8(base, c.op, constraint.op.code());
                marshal::write_u8(base, c.usable, u8::from(constraint.usable));
                marshal::write_i32(base, c.term_offset, constraint.term_offset);
            }
        }
        let o = LAYOUT.order_by;
        for (i, order_by) in self.order_bys.iter().enumerate() {
            let base = unsafe { (order_bys_ptr as *mut u8).add(i * o.size) } as *mut c_void;
            unsafe {
                marshal::write_i32(base, o.column, order_by.column);
                marshal::write_u8(base, o.desc, u8::from(order_by.desc));
            }
        }
        Ok(())
    }
}

impl IndexOutputs {
    unsafe fn read_native(
        &mut self,
        caps: IndexCapabilities,
        info: *const c_void,
        n_constraint: usize,
    ) -> Result<()> {
        let usages_ptr = unsafe { marshal::read_ptr(info, LAYOUT.a_constraint_usage) };
        if n_constraint > 0 && usages_ptr.is_null() {
            return Err(Error::invalid_state("index info usage array is null"));
        }
        let u = LAYOUT.usage;
        for (i, usage) in self.constraint_usages.iter_mut().enumerate() {
            let base = unsafe { (usages_ptr as *const u8).add(i * u.size) } as *const c_void;
            unsafe {
                usage.argv_index = marshal::read_i32(base, u.argv_index);
                usage.omit = marshal::read_u8(base, u.omit) != 0;
            }
        }
        unsafe {
            self.index_number = marshal::read_i32(info, LAYOUT.idx_num);
            let idx_str = marshal::read_ptr(info, LAYOUT.idx_str) as *const u8;
            self.index_string = marshal::utf8_from_native(idx_str, None);
            self.order_by_consumed = marshal::read_i32(info, LAYOUT.order_by_consumed) != 0;
            self.estimated_cost = Some(marshal::read_f64(info, LAYOUT.estimated_cost));
            if caps.can_use_estimated_rows() {
                self.estimated_rows = Some(marshal::read_i64(info, LAYOUT.estimated_rows));
            }
            if caps.can_use_index_flags() {
                self.index_flags =
                    Some(IndexFlags::from_bits(marshal::read_i32(info, LAYOUT.idx_flags)));
            }
            if caps.can_use_columns_used() {
                self.columns_used = Some(marshal::read_i64(info, LAYOUT.col_used) as u64);
            }
        }
        Ok(())
    }

    unsafe fn write_native<P: Sqlite3Api>(
        &self,
        api: &P,
        caps: IndexCapabilities,
        info: *mut c_void,
    ) -> Result<()> {
        let n_constraint = count(unsafe { marshal::read_i32(info, LAYOUT.n_constraint) });
        let usages_ptr = unsafe { marshal::read_ptr(info, LAYOUT.a_constraint_usage) };
        let written = self.constraint_usages.len().min(n_constraint);
        if written > 0 && usages_ptr.is_null() {
            return Err(Error::invalid_state("index info usage array is null"));
        }
        let u = LAYOUT.usage;
        for (i, usage) in self.constraint_usages.iter().take(written).enumerate() {
            let base = unsafe { (usages_ptr as *mut u8).add(i * u.size) } as *mut c_void;
            unsafe {
                marshal::write_i32(base, u.argv_index, usage.argv_index);
                marshal::write_u8(base, u.omit, u8::from(usage.omit));
            }
        }

        unsafe { marshal::write_i32(info, LAYOUT.idx_num, self.index_number) };
        if let Some(index_string) = &self.index_string {
            let copy = marshal::alloc_utf8(api, index_string);
            if copy.is_null() {
                return Err(Error::no_memory("out of memory copying index string"));
            }
            unsafe {
                if marshal::read_i32(info, LAYOUT.need_to_free_idx_str) != 0 {
                    marshal::free(api, marshal::read_ptr(info, LAYOUT.idx_str));
                }
                marshal::write_ptr(info, LAYOUT.idx_str, copy as *mut c_void);
                marshal::write_i32(info, LAYOUT.need_to_free_idx_str, 1);
            }
        }
        unsafe {
            marshal::write_i32(info, LAYOUT.order_by_consumed, i32::from(self.order_by_consumed));
            if let Some(cost) = self.estimated_cost {
                marshal::write_f64(info, LAYOUT.estimated_cost, cost);
            }
            if let Some(rows) = self.estimated_rows {
                if caps.can_use_estimated_rows() {
                    marshal::write_i64(info, LAYOUT.estimated_rows, rows);
                }
            }
            if let Some(flags) = self.index_flags {
                if caps.can_use_index_flags() {
                    marshal::write_i32(info, LAYOUT.idx_flags, flags.bits());
                }
            }
            if let Some(columns) = self.columns_used {
                if caps.can_use_columns_used() {
                    marshal::write_i64(info, LAYOUT.col_used, columns as i64);
                }
            }
        }
        Ok(())
    }
}

/// A complete native `sqlite3_index_info` (struct and arrays) allocated with
/// the engine allocator, for driving xBestIndex outside the engine.
pub struct NativeIndexInfo<'a, P: Sqlite3Api> {
    api: &'a P,
    info: NonNull<c_void>,
    constraints: *mut c_void,
    order_bys: *mut c_void,
    usages: *mut c_void,
}

impl<'a, P: Sqlite3Api> NativeIndexInfo<'a, P> {
    /// Allocate and fill a native struct from `negotiation`'s inputs and
    /// outputs.
    pub fn new(
        api: &'a P,
        caps: IndexCapabilities,
        negotiation: &IndexNegotiation,
    ) -> Result<Self> {
        let info = marshal::allocate_zeroed(api, LAYOUT.size)
            .ok_or_else(|| Error::no_memory("out of memory allocating index info"))?;
        let mut out = Self {
            api,
            info,
            constraints: core::ptr::null_mut(),
            order_bys: core::ptr::null_mut(),
            usages: core::ptr::null_mut(),
        };
        let n_constraint = negotiation.inputs.constraints.len();
        let n_order_by = negotiation.inputs.order_bys.len();
        out.constraints = out.array(n_constraint, LAYOUT.constraint.size)?;
        out.order_bys = out.array(n_order_by, LAYOUT.order_by.size)?;
        out.usages = out.array(n_constraint, LAYOUT.usage.size)?;
        let raw = out.info.as_ptr();
        unsafe {
            marshal::write_i32(raw, LAYOUT.n_constraint, n_constraint as i32);
            marshal::write_ptr(raw, LAYOUT.a_constraint, out.constraints);
            marshal::write_i32(raw, LAYOUT.n_order_by, n_order_by as i32);
            marshal::write_ptr(raw, LAYOUT.a_order_by, out.order_bys);
            marshal::write_ptr(raw, LAYOUT.a_constraint_usage, out.usages);
            negotiation.to_native(api, caps, raw, true)?;
        }
        Ok(out)
    }

    fn array(&self, len: usize, element: usize) -> Result<*mut c_void> {
        if len == 0 {
            return Ok(core::ptr::null_mut());
        }
        marshal::allocate_zeroed(self.api, len * element)
            .map(NonNull::as_ptr)
            .ok_or_else(|| Error::no_memory("out of memory allocating index info array"))
    }

    /// Raw `sqlite3_index_info*` to pass to xBestIndex.
    pub fn as_ptr(&self) -> *mut c_void {
        self.info.as_ptr()
    }
}

impl<P: Sqlite3Api> Drop for NativeIndexInfo<'_, P> {
    fn drop(&mut self) {
        let raw = self.info.as_ptr();
        unsafe {
            if marshal::read_i32(raw, LAYOUT.need_to_free_idx_str) != 0 {
                marshal::free(self.api, marshal::read_ptr(raw, LAYOUT.idx_str));
            }
        }
        marshal::free(self.api, self.usages);
        marshal::free(self.api, self.order_bys);
        marshal::free(self.api, self.constraints);
        marshal::free(self.api, raw);
    }
}
