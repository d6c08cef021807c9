mod lifecycle;
mod queue;
mod support;
