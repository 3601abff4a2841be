use crate::ir::{
    literal::Literal,
    types::{write_list, IntWidth, Type},
};
use derive_more::IsVariant;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{self, Debug, Display},
    sync::Arc,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, IsVariant,
)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Not => "!",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, IsVariant,
)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Max,
    Min,
}

impl BinaryOp {
    pub const fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod)
    }

    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Neq | Self::Lt | Self::Lte | Self::Gt | Self::Gte,
        )
    }

    pub const fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::And => "&&",
            Self::Or => "||",
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Max => "max",
            Self::Min => "min",
        }
    }
}

/// The shape of an expression node
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, IsVariant,
)]
pub enum ExprKind {
    Literal(Literal),
    Var(String),
    Field(Expr, usize),
    Deref(Expr),
    Borrow(Expr),
    Clone(Expr),
    /// Converts the operand into the expression's type
    Cast(Expr),
    Unary(UnaryOp, Expr),
    Binary(BinaryOp, Expr, Expr),
    IsNull(Expr),
    If {
        condition: Expr,
        positive: Expr,
        negative: Expr,
    },
    Tuple(Vec<Expr>),
    RawTuple(Vec<Expr>),
    Let {
        name: String,
        init: Expr,
        body: Expr,
    },
    /// A call to a function provided by the runtime
    Call {
        function: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExprNode {
    kind: ExprKind,
    ty: Type,
}

/// An immutable, structurally compared expression
///
/// Expressions are built through typed constructors which panic when given
/// operands of the wrong type, a malformed expression is always a bug within
/// the pass building it
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expr(Arc<ExprNode>);

impl Expr {
    fn new(kind: ExprKind, ty: Type) -> Self {
        Self(Arc::new(ExprNode { kind, ty }))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }

    /// Returns true if both expressions are the same instance
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        if let ExprKind::Literal(literal) = self.kind() {
            Some(literal)
        } else {
            None
        }
    }

    pub fn as_var(&self) -> Option<&str> {
        if let ExprKind::Var(name) = self.kind() {
            Some(name)
        } else {
            None
        }
    }

    pub fn is_literal(&self) -> bool {
        self.kind().is_literal()
    }

    /// Returns true if the expression is a literal `NULL` of any type
    pub fn is_null_literal(&self) -> bool {
        self.as_literal().is_some_and(Literal::is_null_value)
    }

    /// Creates a literal of the given type
    ///
    /// # Panics
    ///
    /// Panics if the payload doesn't match the type or is `NULL` while the
    /// type isn't nullable
    pub fn literal(literal: Literal, ty: Type) -> Self {
        let matches = match (&literal, &ty) {
            (Literal::Null, Type::Null) => true,
            (Literal::Bool(value), Type::Bool { nullable }) => value.is_some() || *nullable,
            (Literal::Int(value), Type::Int { width, nullable }) => match value {
                Some(value) => width.contains(*value),
                None => *nullable,
            },
            (Literal::Decimal(value), Type::Decimal { nullable, .. }) => {
                value.is_some() || *nullable
            }
            (Literal::String(value), Type::String { nullable, .. }) => {
                value.is_some() || *nullable
            }
            _ => false,
        };
        assert!(matches, "created literal {literal} with mismatched type {ty}");

        Self::new(ExprKind::Literal(literal), ty)
    }

    pub fn bool(value: bool) -> Self {
        Self::literal(Literal::Bool(Some(value)), Type::bool())
    }

    pub fn int(value: i64, width: IntWidth) -> Self {
        Self::literal(Literal::Int(Some(value)), Type::int(width))
    }

    pub fn i32(value: i32) -> Self {
        Self::int(i64::from(value), IntWidth::I32)
    }

    pub fn i64(value: i64) -> Self {
        Self::int(value, IntWidth::I64)
    }

    pub fn decimal(value: Decimal, precision: u32, scale: u32) -> Self {
        Self::literal(
            Literal::Decimal(Some(value)),
            Type::decimal(precision, scale),
        )
    }

    pub fn string<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self::literal(Literal::String(Some(value.into())), Type::string())
    }

    /// The `NULL` value of `ty`, which is made nullable
    pub fn null(ty: &Type) -> Self {
        if ty.is_null() {
            return Self::literal(Literal::Null, Type::Null);
        }
        Self::literal(Literal::null_of(ty), ty.with_nullable(true))
    }

    pub fn var<N>(name: N, ty: Type) -> Self
    where
        N: Into<String>,
    {
        Self::new(ExprKind::Var(name.into()), ty)
    }

    /// Accesses the `idx`th field of a tuple
    ///
    /// # Panics
    ///
    /// Panics if the expression isn't a tuple or `idx` is out of bounds
    pub fn field(&self, idx: usize) -> Self {
        let ty = match self.ty().tuple_fields() {
            Some(fields) => match fields.get(idx) {
                Some(ty) => ty.clone(),
                None => panic!(
                    "field {idx} is out of bounds for {} which has {} fields",
                    self.ty(),
                    fields.len(),
                ),
            },
            None => panic!("accessed field {idx} of non-tuple type {}", self.ty()),
        };

        Self::new(ExprKind::Field(self.clone(), idx), ty)
    }

    /// # Panics
    ///
    /// Panics if the expression isn't a reference
    pub fn deref(&self) -> Self {
        match self.ty() {
            Type::Ref(inner) => Self::new(ExprKind::Deref(self.clone()), (**inner).clone()),
            ty => panic!("dereferenced non-reference type {ty}"),
        }
    }

    pub fn borrow(&self) -> Self {
        Self::new(ExprKind::Borrow(self.clone()), self.ty().reference())
    }

    pub fn clone_value(&self) -> Self {
        Self::new(ExprKind::Clone(self.clone()), self.ty().clone())
    }

    /// # Panics
    ///
    /// Panics if either type isn't a scalar
    pub fn cast(&self, ty: Type) -> Self {
        assert!(
            self.ty().is_scalar() && ty.is_scalar(),
            "cannot cast {} to {ty}",
            self.ty(),
        );
        Self::new(ExprKind::Cast(self.clone()), ty)
    }

    /// # Panics
    ///
    /// Panics if `not` is applied to a non-boolean or `neg` to a non-number
    pub fn unary(op: UnaryOp, operand: &Self) -> Self {
        let ty = operand.ty();
        match op {
            UnaryOp::Neg => assert!(
                ty.is_numeric() || ty.is_null(),
                "negated non-numeric type {ty}",
            ),
            UnaryOp::Not => assert!(
                ty.is_bool() || ty.is_null(),
                "applied `not` to non-boolean type {ty}",
            ),
        }

        let ty = if ty.is_null() && op.is_not() {
            Type::Bool { nullable: true }
        } else {
            ty.clone()
        };
        Self::new(ExprKind::Unary(op, operand.clone()), ty)
    }

    /// # Panics
    ///
    /// Panics if the operand types don't agree with each other or the
    /// operator
    pub fn binary(op: BinaryOp, lhs: &Self, rhs: &Self) -> Self {
        let ty = binary_type(op, lhs.ty(), rhs.ty());
        Self::new(ExprKind::Binary(op, lhs.clone(), rhs.clone()), ty)
    }

    /// Produces a non-nullable boolean which is true if the operand is `NULL`
    pub fn test_null(&self) -> Self {
        Self::new(ExprKind::IsNull(self.clone()), Type::bool())
    }

    /// # Panics
    ///
    /// Panics if the condition isn't boolean or the branches have different
    /// types
    pub fn if_then_else(condition: &Self, positive: &Self, negative: &Self) -> Self {
        assert!(
            condition.ty().is_bool() || condition.ty().is_null(),
            "if condition has non-boolean type {}",
            condition.ty(),
        );

        let ty = match (positive.ty(), negative.ty()) {
            (Type::Null, ty) | (ty, Type::Null) => ty.with_nullable(true),
            (pos, neg) if pos.same_base(neg) => {
                pos.with_nullable(pos.is_nullable() || neg.is_nullable())
            }
            (pos, neg) => panic!("if branches have mismatched types {pos} and {neg}"),
        };

        Self::new(
            ExprKind::If {
                condition: condition.clone(),
                positive: positive.clone(),
                negative: negative.clone(),
            },
            ty,
        )
    }

    pub fn tuple(fields: Vec<Self>) -> Self {
        let ty = Type::tuple(fields.iter().map(|field| field.ty().clone()));
        Self::new(ExprKind::Tuple(fields), ty)
    }

    pub fn raw_tuple(fields: Vec<Self>) -> Self {
        let ty = Type::raw_tuple(fields.iter().map(|field| field.ty().clone()));
        Self::new(ExprKind::RawTuple(fields), ty)
    }

    pub fn let_in<N>(name: N, init: &Self, body: &Self) -> Self
    where
        N: Into<String>,
    {
        Self::new(
            ExprKind::Let {
                name: name.into(),
                init: init.clone(),
                body: body.clone(),
            },
            body.ty().clone(),
        )
    }

    pub fn call<F>(function: F, args: Vec<Self>, ty: Type) -> Self
    where
        F: Into<String>,
    {
        Self::new(
            ExprKind::Call {
                function: function.into(),
                args,
            },
            ty,
        )
    }

    /// Calls `visit` on each direct child of the expression
    pub fn for_each_child<'a, F>(&'a self, mut visit: F)
    where
        F: FnMut(&'a Self),
    {
        match self.kind() {
            ExprKind::Literal(_) | ExprKind::Var(_) => {}

            ExprKind::Field(expr, _)
            | ExprKind::Deref(expr)
            | ExprKind::Borrow(expr)
            | ExprKind::Clone(expr)
            | ExprKind::Cast(expr)
            | ExprKind::Unary(_, expr)
            | ExprKind::IsNull(expr) => visit(expr),

            ExprKind::Binary(_, lhs, rhs) => {
                visit(lhs);
                visit(rhs);
            }

            ExprKind::If {
                condition,
                positive,
                negative,
            } => {
                visit(condition);
                visit(positive);
                visit(negative);
            }

            ExprKind::Tuple(fields) | ExprKind::RawTuple(fields) => fields.iter().for_each(visit),
            ExprKind::Call { args, .. } => args.iter().for_each(visit),

            ExprKind::Let { init, body, .. } => {
                visit(init);
                visit(body);
            }
        }
    }

    /// Rebuilds the expression with each direct child replaced by
    /// `map(child)`, types are recomputed from the new children
    ///
    /// Returns the same instance when every child is unchanged
    pub fn map_children<'a, F>(&'a self, mut map: F) -> Self
    where
        F: FnMut(&'a Self) -> Self,
    {
        let mut changed = false;
        let mut map = |expr: &'a Self| {
            let mapped = map(expr);
            changed |= !mapped.ptr_eq(expr);
            mapped
        };

        let rebuilt = match self.kind() {
            ExprKind::Literal(_) | ExprKind::Var(_) => return self.clone(),

            ExprKind::Field(expr, idx) => map(expr).field(*idx),
            ExprKind::Deref(expr) => map(expr).deref(),
            ExprKind::Borrow(expr) => map(expr).borrow(),
            ExprKind::Clone(expr) => map(expr).clone_value(),
            ExprKind::Cast(expr) => map(expr).cast(self.ty().clone()),
            ExprKind::Unary(op, expr) => Self::unary(*op, &map(expr)),
            ExprKind::IsNull(expr) => map(expr).test_null(),
            ExprKind::Binary(op, lhs, rhs) => {
                let lhs = map(lhs);
                Self::binary(*op, &lhs, &map(rhs))
            }

            ExprKind::If {
                condition,
                positive,
                negative,
            } => {
                let condition = map(condition);
                let positive = map(positive);
                Self::if_then_else(&condition, &positive, &map(negative))
            }

            ExprKind::Tuple(fields) => Self::tuple(fields.iter().map(&mut map).collect()),
            ExprKind::RawTuple(fields) => {
                Self::raw_tuple(fields.iter().map(&mut map).collect())
            }
            ExprKind::Call { function, args } => Self::call(
                function.clone(),
                args.iter().map(&mut map).collect(),
                self.ty().clone(),
            ),

            ExprKind::Let { name, init, body } => {
                let init = map(init);
                Self::let_in(name.clone(), &init, &map(body))
            }
        };

        if changed {
            rebuilt
        } else {
            self.clone()
        }
    }

    /// Rewrites the expression bottom-up, `rewrite` sees each node after
    /// its children were rewritten
    pub fn rewrite_bottom_up<F>(&self, rewrite: &mut F) -> Self
    where
        F: FnMut(Self) -> Self,
    {
        let expr = self.map_children(|child| child.rewrite_bottom_up(rewrite));
        rewrite(expr)
    }

    /// The variables the expression reads without binding them
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut free = BTreeSet::new();
        self.collect_free_variables(&mut Vec::new(), &mut free);
        free
    }

    fn collect_free_variables<'a>(&'a self, bound: &mut Vec<&'a str>, free: &mut BTreeSet<String>) {
        match self.kind() {
            ExprKind::Var(name) => {
                if !bound.contains(&name.as_str()) {
                    free.insert(name.clone());
                }
            }

            ExprKind::Let { name, init, body } => {
                init.collect_free_variables(bound, free);
                bound.push(name);
                body.collect_free_variables(bound, free);
                bound.pop();
            }

            _ => self.for_each_child(|child| child.collect_free_variables(bound, free)),
        }
    }

    /// Every variable name mentioned anywhere within the expression,
    /// including bound ones
    pub fn names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, names: &mut BTreeSet<String>) {
        match self.kind() {
            ExprKind::Var(name) => {
                names.insert(name.clone());
            }
            ExprKind::Let { name, .. } => {
                names.insert(name.clone());
            }
            _ => {}
        }
        self.for_each_child(|child| child.collect_names(names));
    }

    /// Counts the free occurrences of `name`
    pub fn count_uses(&self, name: &str) -> usize {
        match self.kind() {
            ExprKind::Var(var) => usize::from(var == name),
            ExprKind::Let {
                name: bound,
                init,
                body,
            } => {
                init.count_uses(name)
                    + if bound == name {
                        0
                    } else {
                        body.count_uses(name)
                    }
            }
            _ => {
                let mut uses = 0;
                self.for_each_child(|child| uses += child.count_uses(name));
                uses
            }
        }
    }

    /// Replaces every free occurrence of `name` with `replacement`,
    /// renaming let bindings which would capture the replacement's
    /// variables
    pub fn substitute(&self, name: &str, replacement: &Self) -> Self {
        let captured = replacement.free_variables();
        self.substitute_inner(name, replacement, &captured)
    }

    fn substitute_inner(&self, name: &str, replacement: &Self, captured: &BTreeSet<String>) -> Self {
        match self.kind() {
            ExprKind::Var(var) if var == name => {
                assert_eq!(
                    var_type_base(self.ty()),
                    var_type_base(replacement.ty()),
                    "substituted {name}: {} with an expression of type {}",
                    self.ty(),
                    replacement.ty(),
                );
                replacement.clone()
            }

            ExprKind::Let {
                name: bound,
                init,
                body,
            } => {
                let init = init.substitute_inner(name, replacement, captured);
                if bound == name {
                    return Self::let_in(bound.clone(), &init, body);
                }

                if captured.contains(bound) && body.count_uses(name) != 0 {
                    let mut taken = body.names();
                    taken.extend(captured.iter().cloned());
                    taken.insert(name.to_owned());
                    let fresh = fresh_name(bound, &taken);

                    let renamed = body.substitute(bound, &Self::var(fresh.clone(), init.ty().clone()));
                    let body = renamed.substitute_inner(name, replacement, captured);
                    Self::let_in(fresh, &init, &body)
                } else {
                    let body = body.substitute_inner(name, replacement, captured);
                    Self::let_in(bound.clone(), &init, &body)
                }
            }

            _ => self.map_children(|child| child.substitute_inner(name, replacement, captured)),
        }
    }

    /// Returns true if evaluating the expression can fail at runtime, e.g.
    /// through division, an arithmetic overflow or a narrowing cast
    pub fn may_fault(&self) -> bool {
        let faults = match self.kind() {
            ExprKind::Binary(op, _, _) => op.is_arithmetic(),
            ExprKind::Unary(UnaryOp::Neg, _) => true,
            ExprKind::Cast(source) => !is_lossless_cast(source.ty(), self.ty()),
            ExprKind::Call { .. } => true,
            _ => false,
        };

        let mut child_faults = false;
        self.for_each_child(|child| child_faults |= child.may_fault());
        faults || child_faults
    }
}

/// Strips references and nullability so that variable substitutions can
/// be checked without caring about how the value is held
fn var_type_base(ty: &Type) -> Type {
    ty.with_nullable(false)
}

/// Picks a name based on `base` that isn't within `taken`
pub(crate) fn fresh_name(base: &str, taken: &BTreeSet<String>) -> String {
    let base = base.trim_end_matches(|c: char| c.is_ascii_digit());
    let base = if base.is_empty() { "v" } else { base };
    let mut idx = 0usize;
    loop {
        let name = format!("{base}{idx}");
        if !taken.contains(&name) {
            return name;
        }
        idx += 1;
    }
}

/// Returns true if every value of `from` can be represented by `to`
pub(crate) fn is_lossless_cast(from: &Type, to: &Type) -> bool {
    let nullable_ok = !from.is_nullable() || to.is_nullable();
    let representable = match (from, to) {
        (Type::Null, _) => to.is_nullable(),
        (Type::Bool { .. }, Type::Bool { .. }) => true,
        (Type::Int { width: from, .. }, Type::Int { width: to, .. }) => from <= to,
        (
            Type::Int { width, .. },
            Type::Decimal {
                precision, scale, ..
            },
        ) => {
            let digits = match width {
                IntWidth::I8 => 3,
                IntWidth::I16 => 5,
                IntWidth::I32 => 10,
                IntWidth::I64 => 19,
            };
            precision.saturating_sub(*scale) >= digits
        }
        (
            Type::Decimal {
                precision: from_precision,
                scale: from_scale,
                ..
            },
            Type::Decimal {
                precision: to_precision,
                scale: to_scale,
                ..
            },
        ) => {
            from_scale <= to_scale
                && from_precision.saturating_sub(*from_scale)
                    <= to_precision.saturating_sub(*to_scale)
        }
        (
            Type::String {
                precision: None, ..
            },
            Type::String {
                precision: None, ..
            },
        ) => true,
        (
            Type::String {
                precision: Some(from),
                ..
            },
            Type::String { precision: to, .. },
        ) => to.map_or(true, |to| *from <= to),
        _ => false,
    };

    nullable_ok && representable
}

fn binary_type(op: BinaryOp, lhs: &Type, rhs: &Type) -> Type {
    let nullable = lhs.is_nullable() || rhs.is_nullable();

    if op.is_comparison() {
        assert!(
            lhs.is_null() || rhs.is_null() || lhs.same_base(rhs),
            "compared mismatched types {lhs} and {rhs}",
        );
        return Type::Bool { nullable };
    }

    if op.is_logical() {
        assert!(
            (lhs.is_bool() || lhs.is_null()) && (rhs.is_bool() || rhs.is_null()),
            "applied {op:?} to non-boolean types {lhs} and {rhs}",
        );
        return Type::Bool { nullable };
    }

    let base = match (lhs, rhs) {
        (Type::Null, Type::Null) => return Type::Null,
        (Type::Null, ty) | (ty, Type::Null) => ty,
        (lhs, rhs) => {
            assert!(
                lhs.same_base(rhs),
                "applied {op:?} to mismatched types {lhs} and {rhs}",
            );
            lhs
        }
    };
    if op.is_arithmetic() {
        assert!(base.is_numeric(), "applied {op:?} to non-numeric type {base}");
    } else {
        assert!(base.is_scalar(), "applied {op:?} to non-scalar type {base}");
    }

    base.with_nullable(nullable)
}

impl Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}: {}", self.ty())
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::Literal(literal) => {
                if literal.is_null_value() {
                    write!(f, "None::<{}>", self.ty())
                } else {
                    write!(f, "{literal}")
                }
            }
            ExprKind::Var(name) => f.write_str(name),
            ExprKind::Field(expr, idx) => write!(f, "{expr}.{idx}"),
            ExprKind::Deref(expr) => write!(f, "(*{expr})"),
            ExprKind::Borrow(expr) => write!(f, "&{expr}"),
            ExprKind::Clone(expr) => write!(f, "{expr}.clone()"),
            ExprKind::Cast(expr) => write!(f, "({expr} as {})", self.ty()),
            ExprKind::Unary(op, expr) => write!(f, "{}{expr}", op.symbol()),
            ExprKind::Binary(op @ (BinaryOp::Max | BinaryOp::Min), lhs, rhs) => {
                write!(f, "{}({lhs}, {rhs})", op.symbol())
            }
            ExprKind::Binary(op, lhs, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
            ExprKind::IsNull(expr) => write!(f, "{expr}.is_none()"),
            ExprKind::If {
                condition,
                positive,
                negative,
            } => write!(f, "if {condition} {{ {positive} }} else {{ {negative} }}"),
            ExprKind::Tuple(fields) => {
                f.write_str("Tup(")?;
                write_list(f, fields)?;
                f.write_str(")")
            }
            ExprKind::RawTuple(fields) => {
                f.write_str("(")?;
                write_list(f, fields)?;
                f.write_str(")")
            }
            ExprKind::Let { name, init, body } => write!(f, "{{ let {name} = {init}; {body} }}"),
            ExprKind::Call { function, args } => {
                write!(f, "{function}(")?;
                write_list(f, args)?;
                f.write_str(")")
            }
        }
    }
}
