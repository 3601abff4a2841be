use crate::{
    error::{internal_error, CompilerResult},
    ir::{
        expr::{fresh_name, Expr, ExprKind},
        types::{write_list, Type},
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{self, Display},
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Param {
    name: String,
    ty: Type,
}

impl Param {
    pub fn new<N>(name: N, ty: Type) -> Self
    where
        N: Into<String>,
    {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn var(&self) -> Expr {
        Expr::var(self.name.clone(), self.ty.clone())
    }
}

impl Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.ty)
    }
}

/// A function embedded within an operator
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Closure {
    params: Vec<Param>,
    body: Expr,
}

impl Closure {
    /// # Panics
    ///
    /// Panics if the body reads variables which aren't parameters or two
    /// parameters share a name
    pub fn new(params: Vec<Param>, body: Expr) -> Self {
        let names: BTreeSet<&str> = params.iter().map(Param::name).collect();
        assert_eq!(names.len(), params.len(), "closure has duplicate parameters");
        if let Some(free) = body
            .free_variables()
            .into_iter()
            .find(|free| !names.contains(free.as_str()))
        {
            panic!("closure body reads unbound variable {free}");
        }

        Self { params, body }
    }

    /// Builds a single parameter closure
    pub fn unary<N, F>(name: N, ty: Type, body: F) -> Self
    where
        N: Into<String>,
        F: FnOnce(&Expr) -> Expr,
    {
        let param = Param::new(name, ty);
        let body = body(&param.var());
        Self::new(vec![param], body)
    }

    /// Builds a closure taking a key and a value, as used by joins
    pub fn ternary<F>(names: [&str; 3], types: [Type; 3], body: F) -> Self
    where
        F: FnOnce(&Expr, &Expr, &Expr) -> Expr,
    {
        let [a, b, c] = names;
        let [ta, tb, tc] = types;
        let params = vec![Param::new(a, ta), Param::new(b, tb), Param::new(c, tc)];
        let body = body(&params[0].var(), &params[1].var(), &params[2].var());
        Self::new(params, body)
    }

    /// The identity function over `&T`, returning a clone of the row
    pub fn identity(ty: &Type) -> Self {
        Self::unary("t", ty.reference(), |t| t.deref().clone_value())
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub const fn body(&self) -> &Expr {
        &self.body
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn param_types(&self) -> impl Iterator<Item = &Type> + '_ {
        self.params.iter().map(Param::ty)
    }

    pub fn result_type(&self) -> &Type {
        self.body.ty()
    }

    /// Returns a closure with the same parameters and a new body, or the same
    /// closure when the body is unchanged
    pub fn with_body(&self, body: Expr) -> Self {
        if body.ptr_eq(&self.body) {
            self.clone()
        } else {
            Self::new(self.params.clone(), body)
        }
    }

    /// Returns true if evaluating the closure can fail at runtime
    pub fn may_fault(&self) -> bool {
        self.body.may_fault()
    }

    /// Returns true if the closure only rearranges fields of its arguments
    pub fn is_projection(&self) -> bool {
        fn projection(expr: &Expr) -> bool {
            match expr.kind() {
                ExprKind::Var(_) => true,
                ExprKind::Field(expr, _)
                | ExprKind::Deref(expr)
                | ExprKind::Borrow(expr)
                | ExprKind::Clone(expr) => projection(expr),
                ExprKind::Tuple(fields) | ExprKind::RawTuple(fields) => {
                    fields.iter().all(projection)
                }
                _ => false,
            }
        }

        projection(&self.body)
    }

    /// Inlines the closure's body with `args` bound to its parameters
    ///
    /// Arguments which are used at most once are substituted directly,
    /// everything else is bound with a `let`
    pub fn inline(&self, args: &[Expr]) -> CompilerResult<Expr> {
        if args.len() != self.params.len() {
            internal_error!(
                "applied closure with {} parameters to {} arguments",
                self.params.len(),
                args.len(),
            );
        }
        for (param, arg) in self.params.iter().zip(args) {
            if !param.ty.same_base(arg.ty()) {
                internal_error!(
                    "applied closure parameter {param} to an argument of type {}",
                    arg.ty(),
                );
            }
        }

        let mut taken = self.body.names();
        for arg in args {
            taken.extend(arg.names());
        }

        // Rename parameters first so that arguments mentioning other
        // parameters' names aren't captured
        let mut body = self.body.clone();
        let mut renamed = Vec::with_capacity(args.len());
        for param in &self.params {
            let fresh = fresh_name(param.name(), &taken);
            taken.insert(fresh.clone());
            body = body.substitute(param.name(), &Expr::var(fresh.clone(), param.ty.clone()));
            renamed.push(fresh);
        }

        let mut bindings = Vec::new();
        for (name, arg) in renamed.iter().zip(args) {
            if body.count_uses(name) <= 1 || is_trivial(arg) {
                body = body.substitute(name, arg);
            } else {
                bindings.push((name.clone(), arg.clone()));
            }
        }

        for (name, arg) in bindings.into_iter().rev() {
            body = Expr::let_in(name, &arg, &body);
        }

        Ok(body)
    }

    /// Composes two unary closures, the result computes `self(inner(x))`
    ///
    /// When `self` takes a reference to the value `inner` produces the
    /// intermediate value is borrowed
    pub fn apply_after(&self, inner: &Self) -> CompilerResult<Self> {
        if self.params.len() != 1 {
            internal_error!(
                "composed a closure with {} parameters after another closure",
                self.params.len(),
            );
        }

        let param_ty = &self.params[0].ty;
        let result = inner.body.clone();
        let arg = if param_ty.same_base(result.ty()) {
            result
        } else if param_ty.strip_ref().same_base(result.ty()) && param_ty.is_ref() {
            result.borrow()
        } else {
            internal_error!(
                "cannot compose closure taking {param_ty} after closure returning {}",
                result.ty(),
            );
        };

        let body = self.inline(&[arg])?;
        Ok(Self::new(inner.params.clone(), body))
    }

    /// Returns true if both closures compute the same function up to a
    /// consistent renaming of parameters and let bindings
    pub fn equivalent(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }

    /// Renames parameters and let bindings positionally, two closures are
    /// equivalent exactly when their canonical forms are equal
    pub fn canonical(&self) -> Self {
        let mut scope: Vec<(String, String)> = self
            .params
            .iter()
            .enumerate()
            .map(|(idx, param)| (param.name.clone(), format!("$p{idx}")))
            .collect();
        let body = canonicalize(&self.body, &mut scope, &mut 0);

        let params = scope
            .into_iter()
            .zip(&self.params)
            .map(|((_, name), param)| Param::new(name, param.ty.clone()))
            .collect();
        Self { params, body }
    }
}

fn is_trivial(expr: &Expr) -> bool {
    match expr.kind() {
        ExprKind::Var(_) | ExprKind::Literal(_) => true,
        ExprKind::Deref(inner) | ExprKind::Borrow(inner) => is_trivial(inner),
        _ => false,
    }
}

fn canonicalize(expr: &Expr, scope: &mut Vec<(String, String)>, lets: &mut usize) -> Expr {
    match expr.kind() {
        ExprKind::Var(name) => {
            let renamed = scope
                .iter()
                .rev()
                .find(|(original, _)| original == name)
                .map_or_else(|| name.clone(), |(_, renamed)| renamed.clone());
            Expr::var(renamed, expr.ty().clone())
        }

        ExprKind::Let { name, init, body } => {
            let init = canonicalize(init, scope, lets);
            let renamed = format!("$l{lets}");
            *lets += 1;

            scope.push((name.clone(), renamed.clone()));
            let body = canonicalize(body, scope, lets);
            scope.pop();

            Expr::let_in(renamed, &init, &body)
        }

        _ => expr.map_children(|child| canonicalize(child, scope, lets)),
    }
}

impl Display for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("|")?;
        write_list(f, &self.params)?;
        write!(f, "| {}", self.body)
    }
}
