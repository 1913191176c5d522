use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use crate::AppError;

pub struct TaskMeta {
    pub name: &'static str,
    pub stack_bytes: Option<usize>,
}

pub trait AppTask {
    fn meta(&self) -> TaskMeta;

    /// Consume what you need, then return a closure that runs the task loop
    fn into_runner(self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static>;
}

/// Spawns every task, releasing them together once all threads exist.
pub fn start_all(tasks: Vec<Box<dyn AppTask>>) -> Result<Vec<(&'static str, JoinHandle<()>)>, AppError> {
    // +1 for the caller to release everybody
    let barrier = Arc::new(Barrier::new(tasks.len() + 1));

    let mut handles = Vec::with_capacity(tasks.len());
    for task in tasks {
        let meta = task.meta();
        let runner = task.into_runner();
        let b = barrier.clone();

        let mut builder = thread::Builder::new().name(meta.name.into());
        if let Some(stack_sz) = meta.stack_bytes {
            builder = builder.stack_size(stack_sz);
        }
        let handle = builder
            .spawn(move || {
                b.wait();
                runner();
            })
            .map_err(|err| AppError::Task(format!("{}: {err}", meta.name)))?;
        handles.push((meta.name, handle));
    }

    barrier.wait();
    Ok(handles)
}
