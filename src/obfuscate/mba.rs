//! Mixed-boolean-arithmetic obfuscation (spec §4.5/§4.6, grounded on the
//! original's `mba_pass`): walk the VM interpreter's own assembled machine
//! code and replace a two-operand ALU instruction with a structurally
//! different but numerically equivalent sequence, exactly as `smc.rs` hides a
//! literal by opt-in helpers called from the handler-emission sites in
//! `vm/v0.rs` rather than as a post-pass over finished code (see DESIGN.md's
//! "Adaptations narrower than the original").

use super::expression::{Expression, A, B};
use crate::error::{CovirtError, Result};
use crate::rng;
use iced_x86::code_asm::*;

fn err(e: iced_x86::IcedError) -> CovirtError {
    CovirtError::SerializerFailure { pass: "mba".to_string(), message: e.to_string() }
}

/// Host GPRs free for the interpreter's own use once `venter` has pushed
/// every v-register-backing GPR to the host stack (spec §4.6's fixed scratch
/// free-list `{r15,r14,r13,r12,r8,rdi,rbx}`): their pre-entry values already
/// live on the stack, so the handler body can clobber the physical registers
/// freely until `vexit` restores them.
const FREE_LIST: [AsmRegister64; 7] = [r15, r14, r13, r12, r8, rdi, rbx];

/// `(match, replacement)` identity pairs applied in rotation (spec's
/// `mba_transformations` table). Each preserves the value of `A op B` while
/// changing its shape.
fn rewrite_rules() -> Vec<(Expression, Expression)> {
    vec![
        (A.xor(B), A.clone().or(B.clone()).sub(A.clone().and(B.clone()))),
        (A.add(B), A.clone().and(B.clone()).add(A.clone().or(B.clone()))),
        (
            A.sub(B),
            A.clone()
                .xor(B.clone().neg())
                .add(A.clone().and(B.clone().neg()))
                .add(A.clone().and(B.clone().neg())),
        ),
        (A.and(B), A.clone().add(B.clone()).sub(A.clone().or(B.clone()))),
        (
            A.or(B),
            A.clone()
                .add(B.clone())
                .add(A.clone().not().or(B.clone().not()))
                .add(Expression::constant(1)),
        ),
        (A.not(), A.clone().neg().add(Expression::constant(-1))),
        (
            A.neg(),
            A.clone().not().or(A.clone()).sub(A.clone()).add(Expression::constant(1)),
        ),
    ]
}

fn base_expression(op: char) -> Option<Expression> {
    Some(match op {
        '+' => A.add(B),
        '-' => A.sub(B),
        '^' => A.xor(B),
        '&' => A.and(B),
        '|' => A.or(B),
        _ => return None,
    })
}

fn apply_op(a: &mut CodeAssembler, op: char, dst: AsmRegister64, src: AsmRegister64) -> Result<()> {
    match op {
        '+' => a.add(dst, src),
        '-' => a.sub(dst, src),
        '^' => a.xor(dst, src),
        '&' => a.and(dst, src),
        '|' => a.or(dst, src),
        op => unreachable!("unknown binary operator {op}"),
    }
    .map_err(err)
}

/// Allocate the next scratch register off the fixed free list, failing with
/// `RegisterExhausted` once it runs out (spec §7, §8 invariant via
/// `assemble_steps`'s "failures from register exhaustion abort").
struct Scratch {
    remaining: &'static [AsmRegister64],
}

impl Scratch {
    fn new() -> Self {
        Self { remaining: &FREE_LIST }
    }

    fn alloc(&mut self) -> Result<AsmRegister64> {
        let (&reg, rest) = self.remaining.split_first().ok_or(CovirtError::RegisterExhausted)?;
        self.remaining = rest;
        Ok(reg)
    }
}

/// Lower an [`Expression`] tree to real x86-64, returning the register
/// holding its value. Leaves reference `a_val`/`b_val` directly; every
/// internal node gets its own scratch register and a decoy `rol`/`ror` pair
/// around register-register operations that survives into the output byte
/// stream (spec's `assemble_steps`: "the dummy rotation survives into the
/// output to defeat pattern-matching analysis").
fn lower(
    a: &mut CodeAssembler,
    expr: &Expression,
    a_val: AsmRegister64,
    b_val: AsmRegister64,
    scratch: &mut Scratch,
) -> Result<AsmRegister64> {
    match expr {
        Expression::Var("A") => Ok(a_val),
        Expression::Var("B") => Ok(b_val),
        Expression::Var(name) => unreachable!("unexpected free variable '{name}' in a closed mba expression"),
        Expression::Const(v) => {
            let reg = scratch.alloc()?;
            a.mov(reg, *v as u64).map_err(err)?;
            Ok(reg)
        }
        Expression::Unary(op, operand) => {
            let src = lower(a, operand, a_val, b_val, scratch)?;
            let dst = scratch.alloc()?;
            a.mov(dst, src).map_err(err)?;
            match op {
                '~' => a.not(dst).map_err(err)?,
                '-' => a.neg(dst).map_err(err)?,
                op => unreachable!("unknown unary operator {op}"),
            }
            Ok(dst)
        }
        Expression::Binary(op, lhs, rhs) => {
            let lreg = lower(a, lhs, a_val, b_val, scratch)?;
            let rreg = lower(a, rhs, a_val, b_val, scratch)?;
            let dst = scratch.alloc()?;
            a.mov(dst, lreg).map_err(err)?;

            let rotate_by = (rng::below(63) + 1) as u32;
            a.rol(dst, rotate_by as i32).map_err(err)?;
            apply_op(a, *op, dst, rreg)?;
            a.ror(dst, rotate_by as i32).map_err(err)?;

            Ok(dst)
        }
    }
}

/// Replace `dst = dst OP src` with an identity-expanded sequence occupying
/// `dst` at the end (spec §4.6). Falls straight through to the direct
/// instruction when `dst` is `rsp`, or when `op` has no MBA rule — spec §8
/// invariant 7: "MBA pass never emits an instruction writing to RSP".
pub fn binary_op(a: &mut CodeAssembler, op: char, dst: AsmRegister64, src: AsmRegister64) -> Result<()> {
    let targets_rsp = iced_x86::Register::from(dst) == iced_x86::Register::RSP;
    let Some(base) = (!targets_rsp).then(|| base_expression(op)).flatten() else {
        return apply_op(a, op, dst, src);
    };

    let rules = rewrite_rules();
    let mut expr = base;
    for _ in 0..3 {
        for (pattern, replacement) in &rules {
            expr = expr.rewrite(pattern, replacement);
        }
    }

    let mut scratch = Scratch::new();
    let result = lower(a, &expr, dst, src, &mut scratch)?;
    a.mov(dst, result).map_err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_rules_preserve_semantics_under_evaluation() {
        for (pattern, replacement) in rewrite_rules() {
            let bound_pattern = pattern.rewrite(&A, &Expression::constant(11)).rewrite(&B, &Expression::constant(3));
            let bound_replacement =
                replacement.rewrite(&A, &Expression::constant(11)).rewrite(&B, &Expression::constant(3));
            assert_eq!(bound_pattern.evaluate(32), bound_replacement.evaluate(32));
        }
    }

    #[test]
    fn binary_op_assembles_to_a_longer_sequence_than_the_direct_instruction() {
        let mut plain = CodeAssembler::new(64).unwrap();
        apply_op(&mut plain, '+', rcx, rdx).unwrap();
        let plain_len = plain.assemble(0).unwrap().len();

        let mut obfuscated = CodeAssembler::new(64).unwrap();
        binary_op(&mut obfuscated, '+', rcx, rdx).unwrap();
        let obfuscated_len = obfuscated.assemble(0).unwrap().len();

        assert!(obfuscated_len > plain_len);
    }

    #[test]
    fn binary_op_never_targets_rsp() {
        // dst == rsp must fall through to the direct instruction untouched;
        // asserting this doesn't panic or misbehave is the whole contract.
        let mut direct = CodeAssembler::new(64).unwrap();
        apply_op(&mut direct, '+', rsp, rdx).unwrap();
        let direct_len = direct.assemble(0).unwrap().len();

        let mut a = CodeAssembler::new(64).unwrap();
        binary_op(&mut a, '+', rsp, rdx).unwrap();
        assert_eq!(a.assemble(0).unwrap().len(), direct_len);
    }
}
