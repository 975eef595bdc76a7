mod assembly;
mod elements;
mod modal;
mod model;
mod statics;
