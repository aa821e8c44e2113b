use crate::krylov::{
    apply_operator, BoxedError, ConvergenceState, IdentityOperator, LinearOperator, OwnedOrMutRef, ScalarProduct,
    SolveError, SolveErrorKind, SolverOutput, StandardScalarProduct, StoppingCriterion,
};
use crate::Real;
use nalgebra::{DVector, DVectorView, DVectorViewMut, Scalar};
use num::Zero;

#[derive(Debug, Clone)]
pub struct BiCgStabWorkspace<T: Scalar> {
    r: DVector<T>,
    r_hat: DVector<T>,
    p: DVector<T>,
    v: DVector<T>,
    y: DVector<T>,
    s: DVector<T>,
    z: DVector<T>,
    t: DVector<T>,
}

struct Buffers<'a, T: Scalar> {
    r: &'a mut DVector<T>,
    r_hat: &'a mut DVector<T>,
    p: &'a mut DVector<T>,
    v: &'a mut DVector<T>,
    y: &'a mut DVector<T>,
    s: &'a mut DVector<T>,
    z: &'a mut DVector<T>,
    t: &'a mut DVector<T>,
}

impl<T: Scalar + Zero> Default for BiCgStabWorkspace<T> {
    fn default() -> Self {
        Self {
            r: DVector::zeros(0),
            r_hat: DVector::zeros(0),
            p: DVector::zeros(0),
            v: DVector::zeros(0),
            y: DVector::zeros(0),
            s: DVector::zeros(0),
            z: DVector::zeros(0),
            t: DVector::zeros(0),
        }
    }
}

impl<T: Scalar + Zero> BiCgStabWorkspace<T> {
    fn prepare_buffers(&mut self, dim: usize) -> Buffers<T> {
        for buffer in [
            &mut self.r,
            &mut self.r_hat,
            &mut self.p,
            &mut self.v,
            &mut self.y,
            &mut self.s,
            &mut self.z,
            &mut self.t,
        ] {
            buffer.resize_vertically_mut(dim, T::zero());
        }
        Buffers {
            r: &mut self.r,
            r_hat: &mut self.r_hat,
            p: &mut self.p,
            v: &mut self.v,
            y: &mut self.y,
            s: &mut self.s,
            z: &mut self.z,
            t: &mut self.t,
        }
    }
}

/// Right-preconditioned BiCGSTAB for general nonsymmetric operators.
///
/// Iterations are counted in half steps: an iteration that converges after its first half
/// counts as a full one.
#[derive(Debug)]
pub struct BiCgStab<'a, T, A, P, S, Criterion>
where
    T: Scalar,
{
    workspace: OwnedOrMutRef<'a, BiCgStabWorkspace<T>>,
    operator: A,
    preconditioner: P,
    scalar_product: S,
    stopping_criterion: Criterion,
    max_iter: Option<usize>,
}

impl<'a, T: Scalar + Zero> BiCgStab<'a, T, (), IdentityOperator, StandardScalarProduct, ()> {
    pub fn new() -> Self {
        Self {
            workspace: OwnedOrMutRef::Owned(BiCgStabWorkspace::default()),
            operator: (),
            preconditioner: IdentityOperator,
            scalar_product: StandardScalarProduct,
            stopping_criterion: (),
            max_iter: None,
        }
    }
}

impl<'a, T: Scalar> BiCgStab<'a, T, (), IdentityOperator, StandardScalarProduct, ()> {
    pub fn with_workspace(workspace: &'a mut BiCgStabWorkspace<T>) -> Self {
        Self {
            workspace: OwnedOrMutRef::MutRef(workspace),
            operator: (),
            preconditioner: IdentityOperator,
            scalar_product: StandardScalarProduct,
            stopping_criterion: (),
            max_iter: None,
        }
    }
}

impl<'a, T: Scalar, P, S, Criterion> BiCgStab<'a, T, (), P, S, Criterion> {
    pub fn with_operator<A>(self, operator: A) -> BiCgStab<'a, T, A, P, S, Criterion> {
        BiCgStab {
            workspace: self.workspace,
            operator,
            preconditioner: self.preconditioner,
            scalar_product: self.scalar_product,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }
}

impl<'a, T: Scalar, A, P, S, Criterion> BiCgStab<'a, T, A, P, S, Criterion> {
    pub fn with_preconditioner<P2>(self, preconditioner: P2) -> BiCgStab<'a, T, A, P2, S, Criterion> {
        BiCgStab {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner,
            scalar_product: self.scalar_product,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }

    pub fn with_scalar_product<S2>(self, scalar_product: S2) -> BiCgStab<'a, T, A, P, S2, Criterion> {
        BiCgStab {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner: self.preconditioner,
            scalar_product,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }

    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self {
            max_iter: Some(max_iter),
            ..self
        }
    }
}

impl<'a, T: Scalar, A, P, S> BiCgStab<'a, T, A, P, S, ()> {
    pub fn with_stopping_criterion<Criterion>(self, stopping_criterion: Criterion) -> BiCgStab<'a, T, A, P, S, Criterion> {
        BiCgStab {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner: self.preconditioner,
            scalar_product: self.scalar_product,
            stopping_criterion,
            max_iter: self.max_iter,
        }
    }
}

fn apply_into<T: Scalar, A: LinearOperator<T>>(
    output: &mut DVector<T>,
    operator: &A,
    input: &DVector<T>,
) -> Result<(), BoxedError> {
    operator.apply(output.into(), input.into())
}

impl<'a, T, A, P, S, Criterion> BiCgStab<'a, T, A, P, S, Criterion>
where
    T: Real,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
    S: ScalarProduct<T>,
    Criterion: StoppingCriterion<T>,
{
    pub fn solve_with_guess<'b>(
        &mut self,
        b: impl Into<DVectorView<'b, T>>,
        x: impl Into<DVectorViewMut<'b, T>>,
    ) -> Result<SolverOutput<T>, SolveError<T>> {
        self.solve_with_guess_(b.into(), x.into())
    }

    #[allow(non_snake_case)]
    fn solve_with_guess_(&mut self, b: DVectorView<T>, mut x: DVectorViewMut<T>) -> Result<SolverOutput<T>, SolveError<T>> {
        use SolveErrorKind::*;
        assert_eq!(b.len(), x.len());

        let mut output = SolverOutput::new();
        let sp = &self.scalar_product;
        let operator = &self.operator;
        let preconditioner = &self.preconditioner;
        let criterion = &self.stopping_criterion;
        let max_iter = self.max_iter;

        let Buffers {
            r,
            r_hat,
            p,
            v,
            y,
            s,
            z,
            t,
        } = self.workspace.prepare_buffers(x.len());

        let dot = |u: &DVector<T>, w: &DVector<T>| -> Result<T, SolveErrorKind> {
            sp.dot(u.into(), w.into()).map_err(ScalarProductError)
        };
        let norm = |u: &DVector<T>| -> Result<T, SolveErrorKind> { sp.norm(u.into()).map_err(ScalarProductError) };

        // r = b - Ax
        if let Err(err) = apply_operator(&mut *r, operator, &x) {
            return Err(SolveError::new(output, OperatorError(err)));
        }
        r.zip_apply(&b, |Ax_i, b_i| *Ax_i = b_i - *Ax_i);
        r_hat.copy_from(&*r);
        p.fill(T::zero());
        v.fill(T::zero());

        let b_norm = match sp.norm(b) {
            Ok(b_norm) => b_norm,
            Err(err) => return Err(SolveError::new(output, ScalarProductError(err))),
        };
        let mut r_norm = match norm(&*r) {
            Ok(r_norm) => r_norm,
            Err(kind) => return Err(SolveError::new(output, kind)),
        };
        output.initial_residual_norm = r_norm;
        output.residual_norm = r_norm;

        if b_norm == T::zero() {
            x.fill(T::zero());
            output.residual_norm = T::zero();
            return Ok(output);
        }

        let check = |output: &SolverOutput<T>, residual_norm: T| {
            criterion.has_converged(&ConvergenceState {
                iteration: output.num_iterations,
                b_norm,
                initial_residual_norm: output.initial_residual_norm,
                residual_norm,
            })
        };

        let mut rho_prev = T::one();
        let mut alpha = T::one();
        let mut omega = T::one();

        loop {
            match check(&output, r_norm) {
                Ok(true) => break,
                Ok(false) => {}
                Err(kind) => return Err(SolveError::new(output, kind)),
            }
            if let Some(max_iter) = max_iter {
                if output.num_iterations >= max_iter {
                    return Err(SolveError::new(output, MaxIterationsReached { max_iter }));
                }
            }

            let rho = match dot(&*r_hat, &*r) {
                Ok(rho) => rho,
                Err(kind) => return Err(SolveError::new(output, kind)),
            };
            if rho == T::zero() || omega == T::zero() {
                return Err(SolveError::new(output, Breakdown));
            }

            if output.num_iterations == 0 {
                p.copy_from(&*r);
            } else {
                let beta = (rho / rho_prev) * (alpha / omega);
                // p <- r + beta * (p - omega * v)
                p.zip_apply(&*v, |p_i, v_i| *p_i -= omega * v_i);
                p.zip_apply(&*r, |p_i, r_i| *p_i = r_i + beta * *p_i);
            }

            // y = M p, v = A y
            if let Err(err) = apply_into(&mut *y, preconditioner, &*p) {
                return Err(SolveError::new(output, PreconditionerError(err)));
            }
            if let Err(err) = apply_into(&mut *v, operator, &*y) {
                return Err(SolveError::new(output, OperatorError(err)));
            }
            let r_hat_v = match dot(&*r_hat, &*v) {
                Ok(value) => value,
                Err(kind) => return Err(SolveError::new(output, kind)),
            };
            if r_hat_v == T::zero() {
                return Err(SolveError::new(output, Breakdown));
            }
            alpha = rho / r_hat_v;

            // s = r - alpha * v
            s.copy_from(&*r);
            s.zip_apply(&*v, |s_i, v_i| *s_i -= alpha * v_i);
            // x <- x + alpha * y
            x.zip_apply(&*y, |x_i, y_i| *x_i += alpha * y_i);

            let s_norm = match norm(&*s) {
                Ok(s_norm) => s_norm,
                Err(kind) => return Err(SolveError::new(output, kind)),
            };
            output.num_iterations += 1;
            match check(&output, s_norm) {
                Ok(true) => {
                    r.copy_from(&*s);
                    output.residual_norm = s_norm;
                    break;
                }
                Ok(false) => {}
                Err(kind) => return Err(SolveError::new(output, kind)),
            }

            // z = M s, t = A z
            if let Err(err) = apply_into(&mut *z, preconditioner, &*s) {
                return Err(SolveError::new(output, PreconditionerError(err)));
            }
            if let Err(err) = apply_into(&mut *t, operator, &*z) {
                return Err(SolveError::new(output, OperatorError(err)));
            }
            let (ts, tt) = match (dot(&*t, &*s), dot(&*t, &*t)) {
                (Ok(ts), Ok(tt)) => (ts, tt),
                (Err(kind), _) | (_, Err(kind)) => return Err(SolveError::new(output, kind)),
            };
            if tt == T::zero() {
                return Err(SolveError::new(output, Breakdown));
            }
            omega = ts / tt;

            // x <- x + omega * z, r = s - omega * t
            x.zip_apply(&*z, |x_i, z_i| *x_i += omega * z_i);
            r.copy_from(&*s);
            r.zip_apply(&*t, |r_i, t_i| *r_i -= omega * t_i);

            r_norm = match norm(&*r) {
                Ok(r_norm) => r_norm,
                Err(kind) => return Err(SolveError::new(output, kind)),
            };
            output.residual_norm = r_norm;
            rho_prev = rho;
        }

        Ok(output)
    }
}
