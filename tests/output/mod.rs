mod run;
mod scripts;
