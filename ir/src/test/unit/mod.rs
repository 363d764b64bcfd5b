mod analysis;
mod bounds;
mod cse;
mod eval;
mod func;
mod simplify;
