//! Stack virtual machine.
//!
//! The reference interpreter: defines the meaning of every instruction.
//! Execution runs over a shared `i64` evaluation stack plus a stack of call
//! frames. Each invocation evaluates relative to a base mark so a callee
//! cannot consume its caller's operands; `Call` moves values between frames
//! explicitly via the argument list.

use thiserror::Error;

use crate::program::{Function, Instruction, Program};

/// A pending function invocation: name, actual arguments, return marker.
///
/// Pushed on entry to a called function and popped on return, even when the
/// body fails.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub function: String,
    pub args: Vec<i64>,
}

/// Errors raised during interpretation.
///
/// `at` is the index of the faulting instruction within the body being
/// executed. On any error the evaluation and call stacks are unwound to
/// empty before control returns to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// An instruction needed more operands than the current frame holds.
    #[error("stack underflow at instruction {at}")]
    StackUnderflow { at: usize },

    /// Integer division by zero. The operands are left unconsumed.
    #[error("division by zero at instruction {at}")]
    DivideByZero { at: usize },

    /// `loadarg` index outside the current frame's arity.
    #[error("argument index {index} out of range (arity {arity}) at instruction {at}")]
    ArgIndexOutOfRange { at: usize, index: u32, arity: u32 },

    /// `call` found fewer stacked values than the callee's arity.
    #[error("call to '{function}' needs {expected} argument(s), stack has {available} at instruction {at}")]
    InsufficientCallArguments {
        at: usize,
        function: String,
        expected: usize,
        available: usize,
    },

    /// `call` named a function the program does not define.
    #[error("unknown function '{name}' at instruction {at}")]
    UnknownFunction { at: usize, name: String },

    /// `call` reached outside `execute_program`.
    #[error("call outside program context at instruction {at}")]
    NoProgramContext { at: usize },

    /// The program declares no `Main`.
    #[error("program has no Main function")]
    NoMainFunction,
}

/// The stack virtual machine. One instance owns its stacks; instances are
/// not shared across threads.
#[derive(Debug, Default)]
pub struct Vm {
    stack: Vec<i64>,
    frames: Vec<CallFrame>,
    trace: bool,
}

impl Vm {
    pub fn new() -> Self {
        Self::default()
    }

    /// A VM that writes each executed instruction to stderr.
    pub fn with_trace() -> Self {
        Self {
            trace: true,
            ..Self::default()
        }
    }

    /// Execute a single instruction sequence with no program context.
    ///
    /// Clears both stacks first. A sequence with no `return` yields the
    /// current top of stack at the end, or 0 if the stack is empty.
    pub fn execute(&mut self, instructions: &[Instruction]) -> Result<i64, RuntimeError> {
        self.stack.clear();
        self.frames.clear();
        self.run(instructions, None, 0).inspect_err(|_| self.unwind())
    }

    /// Execute a program by invoking `Main` with no arguments.
    pub fn execute_program(&mut self, program: &Program) -> Result<i64, RuntimeError> {
        self.stack.clear();
        self.frames.clear();
        let main = program.main().ok_or(RuntimeError::NoMainFunction)?;
        self.invoke(program, main, Vec::new())
            .inspect_err(|_| self.unwind())
    }

    /// Current evaluation-stack contents, top last. Exposed for inspection
    /// by the driver and tests.
    pub fn stack(&self) -> &[i64] {
        &self.stack
    }

    fn unwind(&mut self) {
        self.stack.clear();
        self.frames.clear();
    }

    /// Run one function body: push the frame, execute, pop the frame on
    /// every exit path, hand the result to the caller.
    fn invoke(
        &mut self,
        program: &Program,
        function: &Function,
        args: Vec<i64>,
    ) -> Result<i64, RuntimeError> {
        self.frames.push(CallFrame {
            function: function.name.clone(),
            args,
        });
        let base = self.stack.len();
        let result = self.run(&function.body, Some(program), base);
        self.frames.pop();
        if result.is_ok() {
            self.stack.truncate(base);
        }
        result
    }

    fn run(
        &mut self,
        body: &[Instruction],
        program: Option<&Program>,
        base: usize,
    ) -> Result<i64, RuntimeError> {
        for (at, instr) in body.iter().enumerate() {
            if self.trace {
                eprintln!(
                    "  [{:04}] {:<24} depth={}",
                    at,
                    instr.to_string(),
                    self.stack.len() - base
                );
            }
            match instr {
                Instruction::LoadImm(v) => self.stack.push(*v),
                Instruction::LoadArg(index) => {
                    let args = self.frames.last().map(|f| f.args.as_slice()).unwrap_or(&[]);
                    match args.get(*index as usize) {
                        Some(value) => self.stack.push(*value),
                        None => {
                            return Err(RuntimeError::ArgIndexOutOfRange {
                                at,
                                index: *index,
                                arity: args.len() as u32,
                            })
                        }
                    }
                }
                Instruction::Add => self.binary(base, at, i64::wrapping_add)?,
                Instruction::Sub => self.binary(base, at, i64::wrapping_sub)?,
                Instruction::Mul => self.binary(base, at, i64::wrapping_mul)?,
                Instruction::Div => {
                    if self.stack.len() < base + 2 {
                        return Err(RuntimeError::StackUnderflow { at });
                    }
                    // Peek before popping: a zero divisor must not mutate
                    // the stack.
                    if self.stack.last() == Some(&0) {
                        return Err(RuntimeError::DivideByZero { at });
                    }
                    let b = self.pop(base, at)?;
                    let a = self.pop(base, at)?;
                    self.stack.push(a.wrapping_div(b));
                }
                Instruction::Print => match self.stack.last() {
                    Some(top) if self.stack.len() > base => println!("{}", top),
                    _ => return Err(RuntimeError::StackUnderflow { at }),
                },
                Instruction::Return => return Ok(self.frame_top(base)),
                Instruction::Call(name) => {
                    let program = match program {
                        Some(p) => p,
                        None => return Err(RuntimeError::NoProgramContext { at }),
                    };
                    let callee = program.get(name).ok_or_else(|| {
                        RuntimeError::UnknownFunction {
                            at,
                            name: name.clone(),
                        }
                    })?;
                    let arity = callee.arity() as usize;
                    let available = self.stack.len() - base;
                    if available < arity {
                        return Err(RuntimeError::InsufficientCallArguments {
                            at,
                            function: name.clone(),
                            expected: arity,
                            available,
                        });
                    }
                    // Arguments assemble in reverse-pop order: the value the
                    // caller pushed first lands at index 0.
                    let split = self.stack.len() - arity;
                    let args = self.stack.split_off(split);
                    let result = self.invoke(program, callee, args)?;
                    self.stack.push(result);
                }
            }
        }
        Ok(self.frame_top(base))
    }

    /// Top of the current frame's portion of the stack, or 0 if empty.
    fn frame_top(&self, base: usize) -> i64 {
        if self.stack.len() > base {
            self.stack[self.stack.len() - 1]
        } else {
            0
        }
    }

    fn pop(&mut self, base: usize, at: usize) -> Result<i64, RuntimeError> {
        if self.stack.len() <= base {
            return Err(RuntimeError::StackUnderflow { at });
        }
        self.stack.pop().ok_or(RuntimeError::StackUnderflow { at })
    }

    fn binary(
        &mut self,
        base: usize,
        at: usize,
        op: fn(i64, i64) -> i64,
    ) -> Result<(), RuntimeError> {
        if self.stack.len() < base + 2 {
            return Err(RuntimeError::StackUnderflow { at });
        }
        let b = self.pop(base, at)?;
        let a = self.pop(base, at)?;
        self.stack.push(op(a, b));
        Ok(())
    }
}
