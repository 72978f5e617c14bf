//! Foreign-call bridge for the Teal Virtual Machine.
//!
//! Foreign functions are synchronous host-provided calls: they run to
//! completion on the current worker and never yield. Return values are
//! mapped into the VM's value universe at this boundary.

use crate::error::{VmError, VmResult};
use crate::value::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A host-provided function invocable through FCALL.
pub type ForeignMethod = fn(args: &[Value]) -> VmResult<Value>;

/// Describes a foreign function registration.
pub struct ForeignDescriptor {
    /// The name the bytecode refers to
    pub name: String,

    /// The handler function
    pub handler: ForeignMethod,

    /// Expected argument count, or None for variadic
    pub arity: Option<usize>,
}

/// The registry of foreign functions available to a worker.
pub struct ForeignRegistry {
    methods: HashMap<String, (ForeignMethod, Option<usize>)>,
}

impl ForeignRegistry {
    /// Creates a registry with the standard built-ins registered.
    pub fn new() -> Self {
        let mut registry = Self {
            methods: HashMap::new(),
        };
        registry.register_builtins();
        registry
    }

    /// Creates a registry with no functions at all.
    pub fn empty() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Registers a foreign function.
    pub fn register(&mut self, descriptor: ForeignDescriptor) {
        self.methods
            .insert(descriptor.name, (descriptor.handler, descriptor.arity));
    }

    /// Returns true if a function with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Invokes a foreign function by name, checking arity.
    pub fn invoke(&self, name: &str, args: &[Value]) -> VmResult<Value> {
        let (handler, arity) = self
            .methods
            .get(name)
            .ok_or_else(|| VmError::foreign(name, "unknown foreign function"))?;
        if let Some(expected) = arity {
            if args.len() != *expected {
                return Err(VmError::foreign(
                    name.to_string(),
                    format!("expected {expected} arguments, got {}", args.len()),
                ));
            }
        }
        handler(args)
    }

    fn register_builtins(&mut self) {
        self.register(ForeignDescriptor {
            name: "+".to_string(),
            handler: |args| numeric_binop(args, "+", |a, b| a.checked_add(b), |a, b| a + b),
            arity: Some(2),
        });
        self.register(ForeignDescriptor {
            name: "-".to_string(),
            handler: |args| numeric_binop(args, "-", |a, b| a.checked_sub(b), |a, b| a - b),
            arity: Some(2),
        });
        self.register(ForeignDescriptor {
            name: "*".to_string(),
            handler: |args| numeric_binop(args, "*", |a, b| a.checked_mul(b), |a, b| a * b),
            arity: Some(2),
        });
        self.register(ForeignDescriptor {
            name: "/".to_string(),
            handler: |args| match (&args[0], &args[1]) {
                (Value::Int(_), Value::Int(0)) => {
                    Err(VmError::foreign("/", "division by zero"))
                }
                _ => numeric_binop(args, "/", |a, b| a.checked_div(b), |a, b| a / b),
            },
            arity: Some(2),
        });
        self.register(ForeignDescriptor {
            name: "==".to_string(),
            handler: |args| Ok(Value::Bool(args[0] == args[1])),
            arity: Some(2),
        });
        self.register(ForeignDescriptor {
            name: "<".to_string(),
            handler: |args| compare(args, "<", |ord| ord == std::cmp::Ordering::Less),
            arity: Some(2),
        });
        self.register(ForeignDescriptor {
            name: ">".to_string(),
            handler: |args| compare(args, ">", |ord| ord == std::cmp::Ordering::Greater),
            arity: Some(2),
        });
        self.register(ForeignDescriptor {
            name: "not".to_string(),
            handler: |args| Ok(Value::Bool(!args[0].is_truthy())),
            arity: Some(1),
        });
        self.register(ForeignDescriptor {
            name: "list".to_string(),
            handler: |args| Ok(Value::List(args.to_vec())),
            arity: None,
        });
        self.register(ForeignDescriptor {
            name: "len".to_string(),
            handler: |args| match &args[0] {
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                Value::Str(s) => Ok(Value::Int(s.len() as i64)),
                other => Err(VmError::type_error(
                    "list".to_string(),
                    other.type_name().to_string(),
                )),
            },
            arity: Some(1),
        });
        self.register(ForeignDescriptor {
            name: "nth".to_string(),
            handler: |args| match (&args[0], &args[1]) {
                (Value::List(items), Value::Int(n)) => items
                    .get(*n as usize)
                    .cloned()
                    .ok_or_else(|| {
                        VmError::foreign("nth".to_string(), format!("index {n} out of range"))
                    }),
                (other, _) => Err(VmError::type_error(
                    "list".to_string(),
                    other.type_name().to_string(),
                )),
            },
            arity: Some(2),
        });
        self.register(ForeignDescriptor {
            name: "append".to_string(),
            handler: |args| match &args[0] {
                Value::List(items) => {
                    let mut items = items.clone();
                    items.push(args[1].clone());
                    Ok(Value::List(items))
                }
                other => Err(VmError::type_error(
                    "list".to_string(),
                    other.type_name().to_string(),
                )),
            },
            arity: Some(2),
        });
        self.register(ForeignDescriptor {
            name: "sleep".to_string(),
            handler: |args| {
                let millis = match &args[0] {
                    Value::Int(n) if *n >= 0 => *n as u64,
                    Value::Float(x) if *x >= 0.0 => (*x * 1000.0) as u64,
                    other => {
                        return Err(VmError::type_error(
                            "non-negative number".to_string(),
                            other.to_string(),
                        ))
                    }
                };
                // Int argument is milliseconds, float argument is seconds
                std::thread::sleep(Duration::from_millis(millis));
                Ok(Value::Nil)
            },
            arity: Some(1),
        });
    }
}

impl Default for ForeignRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn numeric_binop(
    args: &[Value],
    name: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> VmResult<Value> {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or_else(|| VmError::foreign(name, "integer overflow")),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        (a, b) => Err(VmError::type_error(
            "number".to_string(),
            format!("{} and {}", a.type_name(), b.type_name()),
        )),
    }
}

fn compare(
    args: &[Value],
    name: &str,
    check: fn(std::cmp::Ordering) -> bool,
) -> VmResult<Value> {
    let ordering = match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| VmError::foreign(name, "NaN comparison"))?,
        (Value::Int(a), Value::Float(b)) => (*a as f64)
            .partial_cmp(b)
            .ok_or_else(|| VmError::foreign(name, "NaN comparison"))?,
        (Value::Float(a), Value::Int(b)) => a
            .partial_cmp(&(*b as f64))
            .ok_or_else(|| VmError::foreign(name, "NaN comparison"))?,
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (a, b) => {
            return Err(VmError::type_error(
                "comparable values".to_string(),
                format!("{} and {}", a.type_name(), b.type_name()),
            ))
        }
    };
    Ok(Value::Bool(check(ordering)))
}
