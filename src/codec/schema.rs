//! FlatBuffers bindings for `schemas/ndarray.fbs`.
//!
//! Laid out the way `flatc --rust` emits them: table wrappers over
//! [`flatbuffers::Table`], vtable slot constants, `create` builders and
//! [`flatbuffers::Verifiable`] impls so [`flatbuffers::root_with_opts`] can
//! check a whole frame before any accessor runs. Data type fields carry the
//! raw `DType` byte; [`super::wire`] maps it to the array types.

use flatbuffers::{FlatBufferBuilder, Follow, ForwardsUOffset, Vector, WIPOffset};

// ============================================================================
// epicsTimeStamp
// ============================================================================

/// Inline `epicsTimeStamp` struct: two little-endian `int`s.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EpicsTimeStamp(pub [u8; 8]);

impl std::fmt::Debug for EpicsTimeStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpicsTimeStamp")
            .field("sec_past_epoch", &self.sec_past_epoch())
            .field("nsec", &self.nsec())
            .finish()
    }
}

impl EpicsTimeStamp {
    pub fn new(sec_past_epoch: i32, nsec: i32) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&sec_past_epoch.to_le_bytes());
        bytes[4..].copy_from_slice(&nsec.to_le_bytes());
        Self(bytes)
    }

    pub fn sec_past_epoch(&self) -> i32 {
        let [a, b, c, d, _, _, _, _] = self.0;
        i32::from_le_bytes([a, b, c, d])
    }

    pub fn nsec(&self) -> i32 {
        let [_, _, _, _, a, b, c, d] = self.0;
        i32::from_le_bytes([a, b, c, d])
    }
}

impl<'a> flatbuffers::Follow<'a> for EpicsTimeStamp {
    type Inner = &'a EpicsTimeStamp;

    #[inline]
    unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
        <&'a EpicsTimeStamp>::follow(buf, loc)
    }
}

impl<'a> flatbuffers::Follow<'a> for &'a EpicsTimeStamp {
    type Inner = &'a EpicsTimeStamp;

    #[inline]
    unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
        flatbuffers::follow_cast_ref::<EpicsTimeStamp>(buf, loc)
    }
}

impl flatbuffers::Push for EpicsTimeStamp {
    type Output = EpicsTimeStamp;

    #[inline]
    unsafe fn push(&self, dst: &mut [u8], _written_len: usize) {
        dst.copy_from_slice(&self.0);
    }
}

impl flatbuffers::Verifiable for EpicsTimeStamp {
    #[inline]
    fn run_verifier(
        v: &mut flatbuffers::Verifier,
        pos: usize,
    ) -> Result<(), flatbuffers::InvalidFlatbuffer> {
        v.in_buffer::<Self>(pos)
    }
}

// ============================================================================
// NDAttribute
// ============================================================================

#[derive(Copy, Clone, PartialEq)]
pub struct NdAttribute<'a> {
    table: flatbuffers::Table<'a>,
}

impl<'a> flatbuffers::Follow<'a> for NdAttribute<'a> {
    type Inner = NdAttribute<'a>;

    #[inline]
    unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
        Self {
            table: flatbuffers::Table::new(buf, loc),
        }
    }
}

impl<'a> NdAttribute<'a> {
    pub const VT_NAME: flatbuffers::VOffsetT = 4;
    pub const VT_DESCRIPTION: flatbuffers::VOffsetT = 6;
    pub const VT_SOURCE: flatbuffers::VOffsetT = 8;
    pub const VT_DATA_TYPE: flatbuffers::VOffsetT = 10;
    pub const VT_VALUE: flatbuffers::VOffsetT = 12;

    pub fn create<'bldr>(
        fbb: &mut FlatBufferBuilder<'bldr>,
        args: &NdAttributeArgs<'bldr>,
    ) -> WIPOffset<NdAttribute<'bldr>> {
        let start = fbb.start_table();
        if let Some(x) = args.value {
            fbb.push_slot_always::<WIPOffset<_>>(Self::VT_VALUE, x);
        }
        if let Some(x) = args.source {
            fbb.push_slot_always::<WIPOffset<_>>(Self::VT_SOURCE, x);
        }
        if let Some(x) = args.description {
            fbb.push_slot_always::<WIPOffset<_>>(Self::VT_DESCRIPTION, x);
        }
        if let Some(x) = args.name {
            fbb.push_slot_always::<WIPOffset<_>>(Self::VT_NAME, x);
        }
        fbb.push_slot::<i8>(Self::VT_DATA_TYPE, args.data_type, 0);
        let o = fbb.end_table(start);
        WIPOffset::new(o.value())
    }

    // Safety for the accessors below: the table was reached through a
    // verified root, so every slot holds a value of the declared type.

    pub fn name(&self) -> Option<&'a str> {
        unsafe { self.table.get::<ForwardsUOffset<&str>>(Self::VT_NAME, None) }
    }

    pub fn description(&self) -> Option<&'a str> {
        unsafe { self.table.get::<ForwardsUOffset<&str>>(Self::VT_DESCRIPTION, None) }
    }

    pub fn source(&self) -> Option<&'a str> {
        unsafe { self.table.get::<ForwardsUOffset<&str>>(Self::VT_SOURCE, None) }
    }

    pub fn data_type(&self) -> i8 {
        unsafe { self.table.get::<i8>(Self::VT_DATA_TYPE, Some(0)) }.unwrap_or(0)
    }

    pub fn value(&self) -> Option<Vector<'a, u8>> {
        unsafe {
            self.table
                .get::<ForwardsUOffset<Vector<'a, u8>>>(Self::VT_VALUE, None)
        }
    }
}

impl flatbuffers::Verifiable for NdAttribute<'_> {
    #[inline]
    fn run_verifier(
        v: &mut flatbuffers::Verifier,
        pos: usize,
    ) -> Result<(), flatbuffers::InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<&str>>("pName", Self::VT_NAME, false)?
            .visit_field::<ForwardsUOffset<&str>>("pDescription", Self::VT_DESCRIPTION, false)?
            .visit_field::<ForwardsUOffset<&str>>("pSource", Self::VT_SOURCE, false)?
            .visit_field::<i8>("dataType", Self::VT_DATA_TYPE, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, u8>>>("pData", Self::VT_VALUE, false)?
            .finish();
        Ok(())
    }
}

#[derive(Default)]
pub struct NdAttributeArgs<'a> {
    pub name: Option<WIPOffset<&'a str>>,
    pub description: Option<WIPOffset<&'a str>>,
    pub source: Option<WIPOffset<&'a str>>,
    pub data_type: i8,
    pub value: Option<WIPOffset<Vector<'a, u8>>>,
}

// ============================================================================
// NDArray
// ============================================================================

#[derive(Copy, Clone, PartialEq)]
pub struct NdArray<'a> {
    table: flatbuffers::Table<'a>,
}

impl<'a> flatbuffers::Follow<'a> for NdArray<'a> {
    type Inner = NdArray<'a>;

    #[inline]
    unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
        Self {
            table: flatbuffers::Table::new(buf, loc),
        }
    }
}

impl<'a> NdArray<'a> {
    pub const VT_ID: flatbuffers::VOffsetT = 4;
    pub const VT_TIMESTAMP: flatbuffers::VOffsetT = 6;
    pub const VT_EPICS_TS: flatbuffers::VOffsetT = 8;
    pub const VT_DIMS: flatbuffers::VOffsetT = 10;
    pub const VT_DATA_TYPE: flatbuffers::VOffsetT = 12;
    pub const VT_DATA: flatbuffers::VOffsetT = 14;
    pub const VT_ATTRIBUTES: flatbuffers::VOffsetT = 16;

    pub fn create<'bldr>(
        fbb: &mut FlatBufferBuilder<'bldr>,
        args: &NdArrayArgs<'bldr>,
    ) -> WIPOffset<NdArray<'bldr>> {
        let start = fbb.start_table();
        // Always written so -0.0 and NaN payloads keep their bits.
        fbb.push_slot_always::<f64>(Self::VT_TIMESTAMP, args.timestamp);
        if let Some(x) = args.attributes {
            fbb.push_slot_always::<WIPOffset<_>>(Self::VT_ATTRIBUTES, x);
        }
        if let Some(x) = args.data {
            fbb.push_slot_always::<WIPOffset<_>>(Self::VT_DATA, x);
        }
        if let Some(x) = args.dims {
            fbb.push_slot_always::<WIPOffset<_>>(Self::VT_DIMS, x);
        }
        if let Some(x) = args.epics_ts {
            fbb.push_slot_always::<EpicsTimeStamp>(Self::VT_EPICS_TS, x);
        }
        fbb.push_slot::<i32>(Self::VT_ID, args.id, 0);
        fbb.push_slot::<i8>(Self::VT_DATA_TYPE, args.data_type, 0);
        let o = fbb.end_table(start);
        WIPOffset::new(o.value())
    }

    pub fn id(&self) -> i32 {
        unsafe { self.table.get::<i32>(Self::VT_ID, Some(0)) }.unwrap_or(0)
    }

    pub fn timestamp(&self) -> f64 {
        unsafe { self.table.get::<f64>(Self::VT_TIMESTAMP, Some(0.0)) }.unwrap_or(0.0)
    }

    pub fn epics_ts(&self) -> Option<&'a EpicsTimeStamp> {
        unsafe { self.table.get::<EpicsTimeStamp>(Self::VT_EPICS_TS, None) }
    }

    pub fn dims(&self) -> Option<Vector<'a, u64>> {
        unsafe {
            self.table
                .get::<ForwardsUOffset<Vector<'a, u64>>>(Self::VT_DIMS, None)
        }
    }

    pub fn data_type(&self) -> i8 {
        unsafe { self.table.get::<i8>(Self::VT_DATA_TYPE, Some(0)) }.unwrap_or(0)
    }

    pub fn data(&self) -> Option<Vector<'a, u8>> {
        unsafe {
            self.table
                .get::<ForwardsUOffset<Vector<'a, u8>>>(Self::VT_DATA, None)
        }
    }

    pub fn attributes(&self) -> Option<Vector<'a, ForwardsUOffset<NdAttribute<'a>>>> {
        unsafe {
            self.table
                .get::<ForwardsUOffset<Vector<'a, ForwardsUOffset<NdAttribute<'a>>>>>(
                    Self::VT_ATTRIBUTES,
                    None,
                )
        }
    }
}

impl flatbuffers::Verifiable for NdArray<'_> {
    #[inline]
    fn run_verifier(
        v: &mut flatbuffers::Verifier,
        pos: usize,
    ) -> Result<(), flatbuffers::InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<i32>("id", Self::VT_ID, false)?
            .visit_field::<f64>("timeStamp", Self::VT_TIMESTAMP, false)?
            .visit_field::<EpicsTimeStamp>("epicsTS", Self::VT_EPICS_TS, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, u64>>>("dims", Self::VT_DIMS, false)?
            .visit_field::<i8>("dataType", Self::VT_DATA_TYPE, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, u8>>>("pData", Self::VT_DATA, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, ForwardsUOffset<NdAttribute>>>>(
                "pAttributeList",
                Self::VT_ATTRIBUTES,
                false,
            )?
            .finish();
        Ok(())
    }
}

#[derive(Default)]
pub struct NdArrayArgs<'a> {
    pub id: i32,
    pub timestamp: f64,
    pub epics_ts: Option<EpicsTimeStamp>,
    pub dims: Option<WIPOffset<Vector<'a, u64>>>,
    pub data_type: i8,
    pub data: Option<WIPOffset<Vector<'a, u8>>>,
    pub attributes: Option<WIPOffset<Vector<'a, ForwardsUOffset<NdAttribute<'a>>>>>,
}
