use derive_more::IsVariant;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The width of a signed integer type
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, IsVariant,
)]
pub enum IntWidth {
    I8,
    I16,
    I32,
    I64,
}

impl IntWidth {
    pub const fn bits(self) -> u32 {
        match self {
            Self::I8 => 8,
            Self::I16 => 16,
            Self::I32 => 32,
            Self::I64 => 64,
        }
    }

    pub const fn min_value(self) -> i64 {
        match self {
            Self::I8 => i8::MIN as i64,
            Self::I16 => i16::MIN as i64,
            Self::I32 => i32::MIN as i64,
            Self::I64 => i64::MIN,
        }
    }

    pub const fn max_value(self) -> i64 {
        match self {
            Self::I8 => i8::MAX as i64,
            Self::I16 => i16::MAX as i64,
            Self::I32 => i32::MAX as i64,
            Self::I64 => i64::MAX,
        }
    }

    /// Returns true if `value` is representable by this width
    pub const fn contains(self, value: i64) -> bool {
        self.min_value() <= value && value <= self.max_value()
    }

    /// The SQL name of the type
    pub const fn sql_name(self) -> &'static str {
        match self {
            Self::I8 => "TINYINT",
            Self::I16 => "SMALLINT",
            Self::I32 => "INTEGER",
            Self::I64 => "BIGINT",
        }
    }
}

/// The type of a value flowing through a circuit or computed by an
/// embedded expression
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, IsVariant,
)]
pub enum Type {
    Bool {
        nullable: bool,
    },
    Int {
        width: IntWidth,
        nullable: bool,
    },
    Decimal {
        precision: u32,
        scale: u32,
        nullable: bool,
    },
    /// A string, `precision` is `None` for an unlimited `VARCHAR`.
    /// `fixed` strings (`CHAR(n)`) are right-padded to their precision
    String {
        precision: Option<u32>,
        fixed: bool,
        nullable: bool,
    },
    /// The type of the untyped `NULL` literal
    Null,
    /// A SQL row
    Tuple(Vec<Type>),
    /// A tuple which is not a SQL row, e.g. a `(key, value)` pair
    RawTuple(Vec<Type>),
    Ref(Box<Type>),
    ZSet(Box<Type>),
    IndexedZSet(Box<Type>, Box<Type>),
}

impl Type {
    pub const fn bool() -> Self {
        Self::Bool { nullable: false }
    }

    pub const fn int(width: IntWidth) -> Self {
        Self::Int {
            width,
            nullable: false,
        }
    }

    pub const fn i8() -> Self {
        Self::int(IntWidth::I8)
    }

    pub const fn i16() -> Self {
        Self::int(IntWidth::I16)
    }

    pub const fn i32() -> Self {
        Self::int(IntWidth::I32)
    }

    pub const fn i64() -> Self {
        Self::int(IntWidth::I64)
    }

    pub const fn decimal(precision: u32, scale: u32) -> Self {
        Self::Decimal {
            precision,
            scale,
            nullable: false,
        }
    }

    /// An unlimited `VARCHAR`
    pub const fn string() -> Self {
        Self::String {
            precision: None,
            fixed: false,
            nullable: false,
        }
    }

    pub const fn varchar(precision: u32) -> Self {
        Self::String {
            precision: Some(precision),
            fixed: false,
            nullable: false,
        }
    }

    pub const fn char(precision: u32) -> Self {
        Self::String {
            precision: Some(precision),
            fixed: true,
            nullable: false,
        }
    }

    pub fn tuple<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = Type>,
    {
        Self::Tuple(fields.into_iter().collect())
    }

    pub fn raw_tuple<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = Type>,
    {
        Self::RawTuple(fields.into_iter().collect())
    }

    pub const fn unit() -> Self {
        Self::RawTuple(Vec::new())
    }

    pub fn zset(element: Type) -> Self {
        Self::ZSet(Box::new(element))
    }

    pub fn indexed_zset(key: Type, value: Type) -> Self {
        Self::IndexedZSet(Box::new(key), Box::new(value))
    }

    /// Wraps the type in a reference
    pub fn reference(&self) -> Self {
        Self::Ref(Box::new(self.clone()))
    }

    /// Strips a single reference from the type, if there is one
    pub fn strip_ref(&self) -> &Self {
        match self {
            Self::Ref(inner) => inner,
            other => other,
        }
    }

    pub const fn is_nullable(&self) -> bool {
        match *self {
            Self::Bool { nullable }
            | Self::Int { nullable, .. }
            | Self::Decimal { nullable, .. }
            | Self::String { nullable, .. } => nullable,
            Self::Null => true,
            Self::Tuple(_)
            | Self::RawTuple(_)
            | Self::Ref(_)
            | Self::ZSet(_)
            | Self::IndexedZSet(_, _) => false,
        }
    }

    /// Returns the same type with the given nullability, types that can't
    /// be nullable are returned unchanged
    pub fn with_nullable(&self, nullable: bool) -> Self {
        let mut ty = self.clone();
        match &mut ty {
            Self::Bool { nullable: n }
            | Self::Int { nullable: n, .. }
            | Self::Decimal { nullable: n, .. }
            | Self::String { nullable: n, .. } => *n = nullable,
            _ => {}
        }
        ty
    }

    /// Returns true if both types are equal when ignoring nullability
    pub fn same_base(&self, other: &Self) -> bool {
        self.with_nullable(false) == other.with_nullable(false)
    }

    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int { .. } | Self::Decimal { .. })
    }

    pub const fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Bool { .. }
                | Self::Int { .. }
                | Self::Decimal { .. }
                | Self::String { .. }
                | Self::Null,
        )
    }

    /// Returns true if the type can be totally ordered and has a minimum
    /// value, i.e. it can carry a lateness bound
    pub const fn is_bounded(&self) -> bool {
        matches!(self, Self::Bool { .. } | Self::Int { .. } | Self::Decimal { .. })
    }

    pub const fn is_collection(&self) -> bool {
        matches!(self, Self::ZSet(_) | Self::IndexedZSet(_, _))
    }

    /// The fields of a tuple or raw tuple
    pub fn tuple_fields(&self) -> Option<&[Type]> {
        match self {
            Self::Tuple(fields) | Self::RawTuple(fields) => Some(fields),
            _ => None,
        }
    }

    /// The number of fields of a tuple, zero for anything else
    pub fn field_count(&self) -> usize {
        self.tuple_fields().map_or(0, <[Type]>::len)
    }

    /// The element type of a Z-set, or the `(&key, &value)` pair an indexed
    /// Z-set hands to closures
    pub fn element_type(&self) -> Option<Type> {
        match self {
            Self::ZSet(element) => Some((**element).clone()),
            Self::IndexedZSet(key, value) => Some(Self::raw_tuple([(**key).clone(), (**value).clone()])),
            _ => None,
        }
    }

    /// The type of the argument a closure receives when applied to the
    /// elements of a collection of this type
    pub fn closure_argument(&self) -> Option<Type> {
        match self {
            Self::ZSet(element) => Some(element.reference()),
            Self::IndexedZSet(key, value) => {
                Some(Self::raw_tuple([key.reference(), value.reference()]))
            }
            _ => None,
        }
    }

    pub fn key_type(&self) -> Option<&Type> {
        match self {
            Self::IndexedZSet(key, _) => Some(key),
            _ => None,
        }
    }

    pub fn value_type(&self) -> Option<&Type> {
        match self {
            Self::IndexedZSet(_, value) => Some(value),
            _ => None,
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nullable = |f: &mut fmt::Formatter<'_>, nullable: bool| {
            if nullable {
                f.write_str("?")
            } else {
                Ok(())
            }
        };

        match self {
            Self::Bool { nullable: n } => {
                f.write_str("bool")?;
                nullable(f, *n)
            }
            Self::Int { width, nullable: n } => {
                write!(f, "i{}", width.bits())?;
                nullable(f, *n)
            }
            Self::Decimal {
                precision,
                scale,
                nullable: n,
            } => {
                write!(f, "decimal({precision}, {scale})")?;
                nullable(f, *n)
            }
            Self::String {
                precision,
                fixed,
                nullable: n,
            } => {
                match (precision, fixed) {
                    (None, _) => f.write_str("string")?,
                    (Some(precision), true) => write!(f, "char({precision})")?,
                    (Some(precision), false) => write!(f, "varchar({precision})")?,
                }
                nullable(f, *n)
            }
            Self::Null => f.write_str("null"),
            Self::Tuple(fields) => {
                f.write_str("Tup(")?;
                write_list(f, fields)?;
                f.write_str(")")
            }
            Self::RawTuple(fields) => {
                f.write_str("(")?;
                write_list(f, fields)?;
                f.write_str(")")
            }
            Self::Ref(inner) => write!(f, "&{inner}"),
            Self::ZSet(element) => write!(f, "ZSet<{element}>"),
            Self::IndexedZSet(key, value) => write!(f, "IndexedZSet<{key}, {value}>"),
        }
    }
}

pub(crate) fn write_list<T>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result
where
    T: Display,
{
    write!(f, "{}", items.iter().format(", "))
}
